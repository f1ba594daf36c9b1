use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use symex_agent::agent::ConnectionManager;
use symex_agent::neural::{ModelWrapper, NetConfig};
use symex_agent::training::{r_learn, MutationProportions, Mutator, MutatorConfig, RunConfig};
use symex_agent::{logging, AgentError, NAME, VERSION};

#[derive(Parser, Debug)]
#[command(name = "symex-agent", version)]
struct Config {
    /// Game server websocket endpoint (repeat for multiple servers)
    #[arg(long = "server-url", default_value = "ws://localhost:9000")]
    server_urls: Vec<String>,

    /// Number of training epochs
    #[arg(short, long, default_value_t = 2)]
    epochs: usize,

    /// Maximum steps per episode
    #[arg(long, default_value_t = 2)]
    max_steps: usize,

    /// Population size
    #[arg(long, default_value_t = 10)]
    n_models: usize,

    /// Node feature width the game server sends
    #[arg(long, default_value_t = 8)]
    feature_dim: i64,

    /// Hidden channels of the GCN layers
    #[arg(long, default_value_t = 64)]
    hidden_channels: i64,

    /// Adam learning rate
    #[arg(long, default_value_t = 1e-2)]
    learning_rate: f64,

    /// Top performers copied verbatim into the next generation
    #[arg(long, default_value_t = 4)]
    n_tops: usize,

    /// Individuals built by averaging the top performers
    #[arg(long, default_value_t = 1)]
    averaged_n_tops: usize,

    /// Individuals built by averaging the whole population
    #[arg(long, default_value_t = 1)]
    n_averaged_all: usize,

    /// Perturbed variants of the tops average
    #[arg(long, default_value_t = 2)]
    random_n_tops_averaged_mutations: usize,

    /// Perturbed variants of the whole-population average
    #[arg(long, default_value_t = 2)]
    random_all_averaged_mutations: usize,

    /// Magnitude of the random parameter perturbation
    #[arg(long, default_value_t = 0.2)]
    mutation_volume: f64,

    /// Probability that an individual parameter is perturbed
    #[arg(long, default_value_t = 0.2)]
    mutation_freq: f64,

    /// Per-step server reply budget, in milliseconds
    #[arg(long, default_value_t = 5000)]
    step_timeout_ms: u64,

    /// Where to save the best model after the final epoch
    #[arg(long)]
    model_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    let _logger = logging::setup_logging()?;

    log::info!("{NAME} {VERSION} starting");

    let mut cm = ConnectionManager::new(
        config.server_urls.clone(),
        Duration::from_millis(config.step_timeout_ms),
    )?;

    // Close the sockets on every exit path, successful or not.
    let outcome = run(&config, &mut cm).await;
    cm.close().await;
    Ok(outcome?)
}

async fn run(config: &Config, cm: &mut ConnectionManager) -> symex_agent::Result<()> {
    if config.epochs == 0 || config.max_steps == 0 || config.n_models == 0 {
        return Err(AgentError::Configuration(
            "epochs, max-steps and n-models must all be positive".to_string(),
        ));
    }

    let net_config = NetConfig {
        feature_dim: config.feature_dim,
        hidden_dims: vec![config.hidden_channels, config.hidden_channels],
        dropout: 0.1,
        learning_rate: config.learning_rate,
    };

    let mutator_config = MutatorConfig {
        proportions: MutationProportions {
            n_tops: config.n_tops,
            averaged_n_tops: config.averaged_n_tops,
            n_averaged_all: config.n_averaged_all,
            random_n_tops_averaged_mutations: config.random_n_tops_averaged_mutations,
            random_all_averaged_mutations: config.random_all_averaged_mutations,
        },
        mutation_volume: config.mutation_volume,
        mutation_freq: config.mutation_freq,
    };
    mutator_config.validate(config.n_models)?;

    let mut population = Vec::with_capacity(config.n_models);
    for _ in 0..config.n_models {
        population.push(ModelWrapper::new(net_config.clone())?);
    }
    log::info!("built a population of {} models", population.len());

    let maps = cm.get_validation_maps().await?;
    let mutator = Mutator::new(mutator_config, net_config);
    let run_config = RunConfig {
        epochs: config.epochs,
        max_steps: config.max_steps,
    };

    let population = r_learn(&run_config, population, &maps, &mutator, cm).await?;

    if let Some(path) = &config.model_out {
        if let Some(best) = population.first() {
            best.save(path)?;
            log::info!("saved best model to {}", path.display());
        }
    }

    log::info!("training finished after {} epochs", config.epochs);
    Ok(())
}
