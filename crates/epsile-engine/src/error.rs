#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine task is not running")]
    Closed,
}
