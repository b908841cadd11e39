pub mod audit;
pub mod capabilities;
pub mod cgroup;
pub mod device_cgroup;
pub mod hotplug_in_child;
pub mod idshift;
pub mod network;
pub mod run;
pub mod seccomp;
pub mod service;
pub mod smartcard;
pub mod time;
pub mod uevent_forward;
pub mod userns;
pub mod volumes;
