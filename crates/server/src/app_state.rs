use engine::EngineContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) engine: EngineContext,
}
