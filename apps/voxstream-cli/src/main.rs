use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use tracing_subscriber::EnvFilter;
use voxstream_common::{ChunkPos, PeerId};
use voxstream_index::PointIndex;
use voxstream_kernel::{ActiveObject, FlatTerrain, World};
use voxstream_stream::{EmergeManager, StreamConfig, StreamServer, WantedSend};

#[derive(Parser)]
#[command(name = "voxstream-cli", about = "CLI tool for voxstream operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and the default streaming config
    Info,
    /// Run a headless streaming session with simulated observers
    Simulate {
        /// Number of ticks to run
        #[arg(short, long, default_value = "200")]
        ticks: u64,
        /// Number of connected observers
        #[arg(short, long, default_value = "4")]
        observers: u16,
        /// Number of wandering entities
        #[arg(short, long, default_value = "100")]
        entities: usize,
        /// Seconds per tick
        #[arg(long, default_value = "0.05")]
        dtime: f32,
        /// Streaming config (JSON); defaults apply to missing fields
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// RNG seed for entity placement
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Check the spatial index against a brute-force scan
    Index {
        /// Number of points
        #[arg(short, long, default_value = "1000")]
        points: u16,
        /// Range queries per round
        #[arg(short, long, default_value = "1000")]
        queries: usize,
        /// RNG seed
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("voxstream-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("kernel: tick={}", World::new().tick());
            println!("default stream config:");
            println!("{}", StreamConfig::default().to_json_pretty()?);
        }
        Commands::Simulate {
            ticks,
            observers,
            entities,
            dtime,
            config,
            seed,
        } => {
            let config = match config {
                Some(path) => StreamConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => StreamConfig::default(),
            };
            simulate(config, ticks, observers, entities, dtime, seed)?;
        }
        Commands::Index {
            points,
            queries,
            seed,
        } => index_check(points, queries, seed)?,
    }

    Ok(())
}

fn simulate(
    config: StreamConfig,
    ticks: u64,
    observers: u16,
    entities: usize,
    dtime: f32,
    seed: u64,
) -> anyhow::Result<()> {
    println!("Simulate: observers={observers}, entities={entities}, ticks={ticks}, seed={seed}");

    let terrain = Arc::new(FlatTerrain::new(-1));
    let mut emerge = EmergeManager::from_config(terrain.clone(), &config)?;
    let mut server = StreamServer::new(config.clone())?;
    let mut world = World::new();
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    let spread = (config.send_radius.max(1) * 16) as f32;
    for _ in 0..entities {
        let position = Vec3::new(
            rng.gen_range(-spread..spread),
            rng.gen_range(0.0..32.0),
            rng.gen_range(-spread..spread),
        );
        let velocity = Vec3::new(rng.gen_range(-2.0..2.0), 0.0, rng.gen_range(-2.0..2.0));
        world.spawn(ActiveObject::entity(position).with_velocity(velocity))?;
    }
    for n in 0..observers {
        let peer = PeerId(n + 1);
        let angle = f32::from(n) * std::f32::consts::TAU / f32::from(observers.max(1));
        let heading = Vec3::new(angle.cos(), 0.0, angle.sin());
        world.spawn(ActiveObject::player(peer, Vec3::new(8.0, 1.0, 8.0)).with_velocity(heading * 4.0))?;
        server.connect(peer);
    }

    // Transfers complete one tick after they start.
    let mut in_flight: Vec<(PeerId, WantedSend)> = Vec::new();
    let mut sends: HashMap<PeerId, usize> = HashMap::new();
    let mut object_updates = 0usize;

    for tick in 0..ticks {
        world.step(dtime);
        if tick % 50 == 25 {
            // Someone digs next to the first player.
            let edit = world
                .objects()
                .iter()
                .find(|(_, o)| o.is_player())
                .map(|(_, o)| ChunkPos::containing(o.position()));
            if let Some(pos) = edit {
                world.edit_chunk(pos);
            }
        }

        for (peer, wanted) in in_flight.drain(..) {
            server.transfer_finished(peer, wanted);
        }
        emerge.process_results(world.map_mut());
        server.handle_world_events(&world.drain_events());
        world.objects_mut().drain_events();
        server.follow_players(world.objects());

        for (peer, request) in server.step(dtime, &world, &mut emerge) {
            tracing::debug!(%peer, wanted = %request.wanted, priority = request.priority, "send");
            *sends.entry(peer).or_default() += 1;
            in_flight.push((peer, request.wanted));
        }
        if tick % 10 == 0 {
            object_updates += server
                .update_objects(world.objects(), spread, 0.0)
                .iter()
                .map(|(_, delta)| delta.added.len() + delta.removed.len())
                .sum::<usize>();
        }
    }

    for session in server.sessions() {
        println!(
            "  {} sends={} known_objects={}",
            session.describe_status(),
            sends.get(&session.peer()).copied().unwrap_or(0),
            session.known_objects().len()
        );
    }
    let stats = server.stats();
    let history = server.step_history();
    println!(
        "Stats: in_flight={}, sent_total={}, idle={}, object_changes={object_updates}",
        stats.in_flight, stats.sent_total, stats.idle_observers
    );
    println!(
        "Scheduler: avg pass={:?}, per observer={:?}, slowest={:?}, suggestion rate={:.2} over {} passes",
        history.mean_step(),
        history.per_observer_cost(),
        history.slowest().map(|s| s.duration).unwrap_or_default(),
        history.suggestion_rate(),
        history.len()
    );
    println!(
        "Map: {} chunks in memory, {} stored, {} emerges pending",
        world.map().len(),
        terrain.stored_count(),
        emerge.pending_count()
    );
    Ok(())
}

fn index_check(points: u16, queries: usize, seed: u64) -> anyhow::Result<()> {
    println!("Index self-check: points={points}, queries={queries}, seed={seed}");
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let mut index: PointIndex<3, i32, u16> = PointIndex::new();
    let mut truth: HashMap<u16, [i32; 3]> = HashMap::new();

    let random_point = |rng: &mut Pcg64Mcg| -> [i32; 3] {
        [rng.gen_range(-500..500), rng.gen_range(-500..500), rng.gen_range(-500..500)]
    };

    for id in 0..points {
        let p = random_point(&mut rng);
        index.insert(p, id);
        truth.insert(id, p);
    }
    check_queries(&index, &truth, queries, &mut rng).context("after insertion")?;

    // Remove most, move some, add fresh ids.
    for id in 0..points {
        if rng.gen_bool(0.8) {
            index.remove(id);
            truth.remove(&id);
        } else if rng.gen_bool(0.5) {
            let p = random_point(&mut rng);
            index.update(p, id);
            truth.insert(id, p);
        }
    }
    check_queries(&index, &truth, queries, &mut rng).context("after removal")?;

    for id in points..points.saturating_mul(2) {
        let p = random_point(&mut rng);
        index.insert(p, id);
        truth.insert(id, p);
    }
    check_queries(&index, &truth, queries, &mut rng).context("after reinsertion")?;

    println!(
        "OK: {} live points in {} generations",
        index.len(),
        index.generation_count()
    );
    Ok(())
}

fn check_queries(
    index: &PointIndex<3, i32, u16>,
    truth: &HashMap<u16, [i32; 3]>,
    queries: usize,
    rng: &mut Pcg64Mcg,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        index.len() == truth.len(),
        "index holds {} points, expected {}",
        index.len(),
        truth.len()
    );
    for _ in 0..queries {
        let a: [i32; 3] = std::array::from_fn(|_| rng.gen_range(-600..600));
        let b: [i32; 3] = std::array::from_fn(|_| rng.gen_range(-600..600));
        let min: [i32; 3] = std::array::from_fn(|k| a[k].min(b[k]));
        let max: [i32; 3] = std::array::from_fn(|k| a[k].max(b[k]));

        let found: BTreeSet<u16> = index.ids_in_box(&min, &max).into_iter().collect();
        let expected: BTreeSet<u16> = truth
            .iter()
            .filter(|(_, p)| (0..3).all(|k| min[k] <= p[k] && p[k] <= max[k]))
            .map(|(id, _)| *id)
            .collect();
        anyhow::ensure!(
            found == expected,
            "query {min:?}..={max:?}: index returned {} ids, brute force {}",
            found.len(),
            expected.len()
        );
    }
    Ok(())
}
