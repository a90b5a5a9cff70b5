//! Event fan-out, delivery scheduling, and the realtime pub/sub broker.

pub mod broker;
pub mod delivery;
pub mod fanout;

pub use broker::{StreamBroker, Subscription};
pub use delivery::{
    compute_defer_seconds, run_delivery_tick, DeliveryTickOutcome, DispatchError, EmailTransport,
    StubEmailTransport,
};
pub use fanout::fan_out_event;
