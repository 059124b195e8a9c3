use anyhow::Result;
use burn::module::Module;
use burn::tensor::Tensor;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use chesscoach::commentary::{build_commentary_decoder, load_or_build_vocabulary};
use chesscoach::config::Config;
use chesscoach::model::INPUT_NAME;
use chesscoach::network::{ComposedModel, SubgraphView};
use chesscoach::storage::LocalStorage;

type Backend = NdArray<f32>;

#[derive(Parser, Debug)]
#[command(name = "chesscoach")]
#[command(about = "ChessCoach network composer", long_about = None)]
struct Cli {
    /// Path to the network config
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Data directory for the corpus and vocabulary (defaults to the XDG data dir)
    #[arg(long)]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build and persist the commentary vocabulary
    Vocabulary,

    /// Build the network and print its views and output shapes
    Summary {
        /// Batch size of the zero input
        #[arg(long, default_value = "1")]
        batch_size: usize,

        /// Also build the commentary decoder
        #[arg(long)]
        commentary: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let storage = match cli.data_root {
        Some(root) => LocalStorage::new(root),
        None => LocalStorage::from_env(),
    };
    tracing::info!(
        "Network {} with data root {}",
        config.network_name,
        storage.root().display()
    );

    match cli.command {
        Commands::Vocabulary => {
            let vocabulary = load_or_build_vocabulary(&config.commentary, &storage)?;
            println!(
                "Vocabulary: {} tokens (capacity {}) at {}",
                vocabulary.len(),
                vocabulary.capacity(),
                storage.resolve(&config.commentary.vocabulary_path).display()
            );
            Ok(())
        }

        Commands::Summary {
            batch_size,
            commentary,
        } => {
            let device = NdArrayDevice::default();
            let composed = ComposedModel::<Backend>::build(&device, &config.model)?;
            println!(
                "{} ({}): {} layers, {} parameters",
                config.network_name,
                config.model.architecture,
                composed.layer_names().len(),
                composed.model().num_params()
            );

            let [d1, d2, d3] = config
                .model
                .data_format
                .spatial_shape(config.model.input_planes_count);
            let input = Tensor::<Backend, 4>::zeros([batch_size, d1, d2, d3], &device);
            println!("{INPUT_NAME}: {:?}", input.dims());

            for view in [SubgraphView::Play, SubgraphView::CommentaryEncoder] {
                println!("[{view}]");
                for (name, output) in composed.view(view).forward(input.clone()) {
                    println!("  {}: {:?}", name.as_str(), output.dims());
                }
            }

            if commentary {
                let (decoder, vocabulary) = build_commentary_decoder::<Backend>(
                    &config.commentary,
                    &storage,
                    composed.commentary_encoder().encoding_width(),
                    &device,
                )?;
                println!(
                    "[commentary decoder]: {} parameters, vocabulary {}",
                    decoder.num_params(),
                    vocabulary.capacity()
                );
            }
            Ok(())
        }
    }
}
