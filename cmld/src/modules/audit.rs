use crate::compartment::{Compartment, CompartmentState};

/// Structured log of every compartment state transition, registered as an
/// observer per §3's "observer notification" design (shipping these
/// records anywhere is explicitly out of scope; this only gets them onto
/// the process's own `tracing` output, the same as every other module in
/// this crate).
pub fn tracing_observer() -> crate::compartment::ObserverFn {
    Box::new(|c: &Compartment, from: CompartmentState, to: CompartmentState| {
        tracing::info!(
            compartment = %c.uuid,
            name = %c.name,
            from = ?from,
            to = ?to,
            "compartment state transition"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cfg() -> CompartmentConfig {
        CompartmentConfig {
            name: "c1".into(),
            guestos: "default".into(),
            uid_range_len: 65536,
            cgroup_memory_limit_bytes: None,
            capabilities_allow: vec![],
            seccomp_profile: None,
        }
    }

    #[test]
    fn tracing_observer_does_not_panic_on_a_transition() {
        let mut c = Compartment::new("c1", cfg(), 0);
        c.add_observer(tracing_observer());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        c.add_observer(Box::new(move |_c, _from, _to| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        c.transition(CompartmentState::Starting).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
