use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use sw_engine::{ClusterConfig, LocalCluster, Schema, Search, SearchConfig, Searchable, Task};
use sw_search::{Algorithm, Distribution, GridSearch, RandomSearch};
use sw_types::{Environment, ParamPath, TaskError};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Minimizes a quadratic bowl by gradient descent, one iteration per step.
#[derive(Debug, Deserialize)]
struct Quadratic {
    start: f64,
    learning_rate: f64,
    iterations: u32,
    #[serde(skip)]
    done: u32,
}

impl Task for Quadratic {
    fn into_searchable(self: Box<Self>) -> Option<Box<dyn Searchable>> {
        Some(self)
    }
}

impl Searchable for Quadratic {
    fn step(&mut self, _env: &Environment) -> Result<bool, TaskError> {
        self.start -= self.learning_rate * 2.0 * self.start;
        self.done += 1;
        Ok(self.done < self.iterations)
    }

    fn metric(&self, _env: &Environment) -> Result<Option<f64>, TaskError> {
        Ok(Some(self.start * self.start))
    }

    fn state(&self) -> Result<serde_json::Value, TaskError> {
        Ok(serde_json::json!({ "x": self.start, "iterations": self.done }))
    }
}

fn demo_schema() -> anyhow::Result<Schema> {
    let schema = Schema::from_fn("quadratic", |params| {
        let task: Quadratic = serde_json::from_value(params)?;
        Ok(Box::new(task) as Box<dyn Task>)
    })
    .with_value("start", 10.0)?
    .with_value("iterations", 20)?
    .with_search(
        ParamPath::from("learning_rate"),
        Distribution::log_uniform(0.001, 0.5),
    )?;
    Ok(schema)
}

/// Run a demo search over a quadratic bowl
#[derive(Parser, Debug)]
#[command(name = "sweep", version, about, long_about = None)]
struct Cli {
    /// Search configuration file (JSON)
    config: Option<PathBuf>,

    /// Search algorithm
    #[arg(long, env = "SWEEP_ALGORITHM", value_enum, default_value_t = AlgorithmKind::Grid)]
    algorithm: AlgorithmKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AlgorithmKind {
    Grid,
    Random,
}

impl AlgorithmKind {
    fn build(self) -> Box<dyn Algorithm> {
        match self {
            Self::Grid => Box::new(GridSearch::new().with_float_steps(4)),
            Self::Random => Box::new(RandomSearch::new(8)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let env = Environment::from_env()?;
    let cluster_config = ClusterConfig::from_env()?.with_local_mode(env.debug);
    let config = match &cli.config {
        Some(path) => SearchConfig::from_json_file(path)?,
        None => SearchConfig::default(),
    };

    let cluster = LocalCluster::connect(cluster_config)?;
    let mut search = Search::new(demo_schema()?, cluster)
        .with_algorithm(cli.algorithm.build())
        .with_config(config);
    info!(run = %search.id(), output = %env.output_path.display(), "running demo search");

    let results = search.run(&env).await?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
