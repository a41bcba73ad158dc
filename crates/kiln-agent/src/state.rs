use crate::{process_manager::ProcessManager, recovery::ExitHandle};

#[derive(Clone)]
pub struct AppState {
    pub manager: ProcessManager,
    pub exit: ExitHandle,
}
