//! VPEs and their placement on PEs

pub mod ctxsw;
pub mod dtustate;
pub mod pemng;
pub mod timeouts;
pub mod vpe;
pub mod vpemng;

pub use ctxsw::{ContextSwitcher, SwitchEnv, SwitchError, SwitchEvent, SwitchState};
pub use dtustate::DtuState;
pub use pemng::{PeManager, PeSched};
pub use timeouts::{TimerEvent, TimerId, Timeouts};
pub use vpe::{EpBinding, Vpe};
pub use vpemng::VpeManager;
