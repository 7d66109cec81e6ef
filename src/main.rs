use anyhow::{Context, Result};
use numa_emu::capture::CaptureChannel;
use numa_emu::cli::{self, Cli, SupervisorConfig};
use numa_emu::clock::MonotonicClock;
use numa_emu::placement::{
    run_on_node, MemoryReservation, NodeTopology, ReservationPlan, NEAR_NODE,
};
use numa_emu::scheduler::{block_child_signals, signal_channel, EventLoop, PeriodicTimer};
use numa_emu::session::{SamplingMode, Session};
use numa_emu::size::to_gib;
use numa_emu::stats::ProcTarget;
use numa_emu::supervisor::{launch, ChildProcess, LaunchOptions};

/// Take away near-node memory until only the budget is left
fn reserve_near_node(topology: &NodeTopology, budget: u64) -> Result<MemoryReservation> {
    let available = topology
        .free_bytes(NEAR_NODE)
        .context("reading near node free memory")?;
    println!("emu: availGB {:.2}", to_gib(available));

    let plan = ReservationPlan::new(budget, available)?;
    if plan.reserve_bytes > 0 {
        println!("emu: allocatingGB {:.2}", to_gib(plan.reserve_bytes));
    }

    Ok(MemoryReservation::pin(plan)?)
}

fn main() -> Result<()> {
    let clock = MonotonicClock::start();
    let cli: Cli = cli::parse_or_exit();
    cli::init_tracing(cli.debug);
    let config = SupervisorConfig::from(cli);

    if let Some(offset) = config.sync {
        println!("emu: sync {}", offset);
    }

    // SIGCHLD is read from a signalfd only; block it before anything can fork
    let blocked = block_child_signals()?;
    let signals = signal_channel(&blocked)?;
    let timer = config.interval.map(PeriodicTimer::new).transpose()?;

    let topology = NodeTopology::system();
    let mut reservation = None;
    let mut placement = None;

    if config.mode == SamplingMode::Locality {
        if let Err(err) = run_on_node(&topology, NEAR_NODE) {
            tracing::warn!("can't run on node {}: {}", NEAR_NODE, err);
        }

        if config.is_leader() {
            if let Some(budget) = config.budget.filter(|b| *b > 0) {
                reservation = Some(reserve_near_node(&topology, budget)?);
            }
            let available = topology
                .free_bytes(NEAR_NODE)
                .context("reading near node free memory")?;
            println!("emu: availGB {:.2}", to_gib(available));
        }

        placement = Some(config.placement_policy().resolve(&topology)?);
    }

    let capture = if config.captures_output() {
        Some(CaptureChannel::open()?)
    } else {
        None
    };

    let launched = launch(
        &config.command,
        LaunchOptions {
            placement,
            capture,
            unblock: Some(blocked),
        },
    )
    .with_context(|| format!("launching '{}'", config.command.join(" ")))?;

    let probe = ProcTarget::new(launched.pid, clock)?;
    let session = Session::new(
        ChildProcess::new(probe),
        timer,
        std::io::stdout(),
        &config.session_config(),
        clock,
    );

    let exit = EventLoop::new(signals, launched.capture, session)?.run()?;
    tracing::debug!(?exit, "target finished");

    if let Some(reservation) = reservation {
        reservation.release()?;
    }

    Ok(())
}
