use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use workshop::HarnessConfig;

/// Renders a glTF mesh as an instanced grid under an orbiting camera.
#[derive(Parser, Debug)]
#[command(name = "workshop", version, about)]
struct Cli {
    /// TOML config file (defaults to ./workshop.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// glTF scene to render
    #[arg(long)]
    mesh: Option<PathBuf>,

    /// Image probed at startup
    #[arg(long)]
    texture: Option<PathBuf>,

    /// SPIR-V vertex stage
    #[arg(long)]
    vertex_shader: Option<PathBuf>,

    /// SPIR-V fragment stage
    #[arg(long)]
    fragment_shader: Option<PathBuf>,

    /// Instances per grid side
    #[arg(long)]
    grid: Option<u32>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(self, config: &mut HarnessConfig) {
        if let Some(mesh) = self.mesh {
            config.assets.mesh = mesh;
        }
        if let Some(texture) = self.texture {
            config.assets.texture = texture;
        }
        if let Some(vs) = self.vertex_shader {
            config.assets.vertex_shader = vs;
        }
        if let Some(fs) = self.fragment_shader {
            config.assets.fragment_shader = fs;
        }
        if let Some(grid) = self.grid {
            config.scene.grid_size = grid;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let mut config =
        HarnessConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);

    info!(
        "workshop: {} with {}x{} instances",
        config.assets.mesh.display(),
        config.scene.grid_size,
        config.scene.grid_size
    );

    workshop::run(config).context("workshop exited with an error")?;
    Ok(())
}
