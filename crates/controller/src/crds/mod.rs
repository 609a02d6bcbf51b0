pub mod autoscalingrunnerset;
pub mod ephemeralrunnerset;
pub mod listener;

pub use autoscalingrunnerset::*;
pub use ephemeralrunnerset::*;
pub use listener::*;
