pub mod dispatch;
pub mod gate;
pub mod push;
pub mod store;

pub use dispatch::DispatchFanout;
pub use gate::{AlertBucket, AlertGate};
pub use push::PushNotifier;
pub use store::{AlertStore, StoredAlert};
