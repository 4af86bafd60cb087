use anyhow::{ensure, Result};
use clap::Parser;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use tally::{
    collective::Communicator,
    config::Config,
    engine::in_memory::{InMemoryEngine, InMemoryGroup},
    operation::{Reduce, Sum},
    reducer::Reducer,
    wire::FixedLayout,
};
use tracing::{info, warn};

mod init;

const DIM: usize = 4;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Number of training rounds.
    #[arg(long, default_value_t = 6)]
    pub rounds: u64,

    /// Rank that crashes once during training.
    #[arg(long, default_value_t = 1)]
    pub crash_rank: usize,

    /// Round after whose allreduce the crash happens. Rounds past the last
    /// one disable the crash.
    #[arg(long, default_value_t = 3)]
    pub crash_round: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
struct Model {
    learning_rate: f64,
    weights: Vec<f64>,
}

#[derive(FixedLayout, Reduce, Clone, Copy, Debug, Default)]
struct RoundStats {
    #[reduce(sum)]
    samples: u64,
    #[reduce(max)]
    worst_loss: f64,
}

/// Per-rank gradient of a round. Stands in for an expensive computation.
fn gradient(rank: usize, round: u64, grad: &mut [f64]) {
    for (i, g) in grad.iter_mut().enumerate() {
        *g = (rank + 1) as f64 * (i + 1) as f64 * 0.01 / (round + 1) as f64;
    }
}

/// Train until `rounds` rounds are checkpointed. Returns `None` if this rank
/// crashed after the allreduce of round `crash_after`.
async fn train(
    comm: Communicator<InMemoryEngine>,
    rounds: u64,
    crash_after: Option<u64>,
) -> Result<Option<Model>> {
    let rank = comm.rank();
    let mut model = Model::default();
    let start = comm.load_checkpoint(&mut model, None::<&mut ()>).await?;

    if start == 0 {
        if rank == 0 {
            model = Model {
                learning_rate: 0.5,
                weights: vec![0.0; DIM],
            };
        }
        comm.broadcast_object(&mut model, 0).await?;
    } else {
        info!(rank, version = start, "resuming from checkpoint");
    }

    let stats_reducer = Reducer::<RoundStats>::new();
    for round in start..rounds {
        let mut grad = [0f64; DIM];
        comm.allreduce::<Sum, f64>(
            &mut grad,
            Some(Box::new(move |grad: &mut [f64]| {
                info!(rank, round, "computing gradient");
                gradient(rank, round, grad);
            })),
        )
        .await?;

        let step = model.learning_rate / comm.world_size() as f64;
        for (w, g) in model.weights.iter_mut().zip(grad) {
            *w -= step * g;
        }

        let mut stats = [RoundStats {
            samples: 128,
            worst_loss: grad[0] * (rank + 1) as f64,
        }];
        stats_reducer.allreduce(comm.engine(), &mut stats, None).await?;

        if crash_after == Some(round) {
            warn!(rank, round, "simulating a crash before checkpointing");
            return Ok(None);
        }

        comm.checkpoint(&model, None::<&()>).await?;
        if rank == 0 {
            comm.tracker_print(format!(
                "round {round}: {} samples, worst loss {:.4}",
                stats[0].samples, stats[0].worst_loss
            ))
            .await?;
        }
    }

    Ok(Some(model))
}

/// Run one rank, restarting it from its last checkpoint whenever it crashes.
async fn supervise(
    group: InMemoryGroup,
    rank: usize,
    rounds: u64,
    mut crash_after: Option<u64>,
) -> Result<Model> {
    loop {
        let comm = group.communicator(rank)?;
        match train(comm, rounds, crash_after.take()).await? {
            Some(model) => return Ok(model),
            None => warn!(rank, "restarting rank from its last checkpoint"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();

    let args = Cli::parse();
    let group = InMemoryGroup::from_config(&args.options)?;
    info!(
        world_size = group.world_size(),
        serializer = %group.serializer(),
        "starting training"
    );

    let crash_round = (args.crash_round < args.rounds).then_some(args.crash_round);
    let handles = (0..group.world_size())
        .map(|rank| {
            let crash_after = crash_round.filter(|_| rank == args.crash_rank);
            tokio::spawn(supervise(group.clone(), rank, args.rounds, crash_after))
        })
        .collect::<Vec<_>>();

    let mut models = Vec::with_capacity(handles.len());
    for handle in handles {
        models.push(handle.await??);
    }

    ensure!(
        models.windows(2).all(|pair| pair[0] == pair[1]),
        "ranks finished with diverging models"
    );
    for message in group.tracker_log().await {
        info!(rank = message.rank, "tracker: {}", message.message);
    }
    info!(weights = ?models[0].weights, "training finished");

    Ok(())
}
