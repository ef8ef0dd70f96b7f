use std::sync::Arc;
use crate::pipeline::ResponsePipeline;

// app's shared state, built once in main and handed to every handler

pub struct AppState {
    pub pipeline: ResponsePipeline,
}

impl AppState {
    pub fn new(pipeline: ResponsePipeline) -> Arc<Self> {
        Arc::new(Self { pipeline })
    }
}
