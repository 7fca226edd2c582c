//! Controllable loads and storage managed by the engine.

/// Home battery with toggleable charge/discharge set-points.
pub mod battery;
/// Consumers and their variants.
pub mod consumer;

pub use battery::{Battery, BatteryEntities, BatterySnapshot};
pub use consumer::{
    BalancingMethod, Consumer, ConsumerEvent, ConsumerKind, ConsumerSettings, ConsumerSnapshot,
    ConsumerState, DynamicLoad,
};
