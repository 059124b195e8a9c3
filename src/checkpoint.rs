use burn::module::Module;
use burn::prelude::*;
use burn::record::{DefaultFileRecorder, FullPrecisionSettings};
use std::path::Path;

use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::layers::LayerBuilder;
use crate::model::ChessCoachModel;
use crate::network::ComposedModel;

type ModelRecorder = DefaultFileRecorder<FullPrecisionSettings>;

/// Save the composed model's weights; the recorder sets the file extension.
pub fn save_model<B: Backend>(model: &ComposedModel<B>, path: &Path) -> Result<(), ModelError> {
    let weights: ChessCoachModel<B> = model.model().as_ref().clone();
    weights.save_file(path, &ModelRecorder::new())?;
    tracing::info!("Saved model to {}", path.display());
    Ok(())
}

/// Load a saved model; both views derive from the loaded weights.
pub fn load_model<B: Backend>(
    path: &Path,
    config: &ModelConfig,
    device: &Device<B>,
) -> Result<ComposedModel<B>, ModelError> {
    let mut builder = LayerBuilder::new(device, config);
    let model = ChessCoachModel::build(&mut builder)?.load_file(
        path,
        &ModelRecorder::new(),
        device,
    )?;
    tracing::info!("Loaded model from {}", path.display());
    Ok(ComposedModel::from_parts(
        model,
        config.clone(),
        builder.into_names(),
    ))
}
