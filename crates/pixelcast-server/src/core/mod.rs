mod device_keepalive;
mod registration;
mod router;
mod subscription_index;
mod supervisor;

pub use device_keepalive::run_device_keepalive_listener;
pub use registration::run_registration_listener;
pub use router::{
    Router, run_monitor_ingest, run_monitor_keepalive_listener, run_subscription_listener,
    run_subscription_purge_loop,
};
pub use supervisor::{Supervisor, run_process_purge_loop};
