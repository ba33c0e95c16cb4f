pub mod depth;
pub mod history;

pub use depth::{DepthError, DepthLadder, VwapFill};
pub use history::{PriceHistory, PriceRecord};
