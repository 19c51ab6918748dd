mod progress;

pub use progress::{Phase, ProgressDrawMode, TransferBar};
