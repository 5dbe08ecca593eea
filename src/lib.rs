pub mod callback;
pub mod error;
pub mod event_loop;
pub mod timer;

pub use callback::{BoxFuture, FlexCallback, NextFire, TimerCallback};
pub use error::LoopError;
pub use event_loop::{EventLoop, LoopHandle, TimerHandle};
pub use timer::FlexTimer;
