pub mod costs;
pub mod generation;
pub mod pipeline;
pub mod settings_layer;
pub mod storage;
