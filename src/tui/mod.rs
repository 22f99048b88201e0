//! 终端界面（model / view / controller）

mod controller;
mod model;
mod view;

pub use controller::run;
pub use model::{App, SessionFactory, TranscriptLine};
pub use view::BufferSurface;
