pub mod alarm;
pub mod broadcaster;
pub mod broker;
pub mod listener;
pub mod memory_broker;
pub mod pipe;
pub mod util;

pub use alarm::Alarm;
pub use broadcaster::Broadcaster;
pub use listener::Listener;

pub mod logging {
    pub fn init() {
        tracing_subscriber::fmt::init();
    }
}
