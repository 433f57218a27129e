use crate::cli::Command;
use rand::Rng;
use seqlock::utils::parse_duration;
use seqlock::{
    AcquireOutcome, LockController, LockError, LockOptions, LockStrategy, MemoryEnsemble,
    ReleaseOutcome, Result,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContenderResult {
    Held,
    TimedOut,
    SessionLost,
}

struct Simulation {
    root: String,
    min_hold: Duration,
    max_hold: Duration,
    strategy: LockStrategy,
    expire_holder: bool,
    quiet: bool,
    ticket: AtomicUsize,
    in_critical: AtomicBool,
    expired: AtomicBool,
}

pub fn execute_simulate(cmd: Command, quiet: bool) -> Result<()> {
    let Command::Simulate {
        contenders,
        root,
        min_hold,
        max_hold,
        timeout,
        no_wait,
        expire_holder,
    } = cmd;

    let min_hold = parse_duration(&min_hold)?;
    let max_hold = parse_duration(&max_hold)?.max(min_hold);
    let strategy = if no_wait {
        LockStrategy::NoWait
    } else if let Some(timeout) = timeout {
        LockStrategy::Timeout(parse_duration(&timeout)?)
    } else {
        LockStrategy::Wait
    };

    let ensemble = MemoryEnsemble::new();
    let sim = Arc::new(Simulation {
        root: root.clone(),
        min_hold,
        max_hold,
        strategy,
        expire_holder,
        quiet,
        ticket: AtomicUsize::new(0),
        in_critical: AtomicBool::new(false),
        expired: AtomicBool::new(false),
    });
    let start = Arc::new(Barrier::new(contenders));

    let mut handles = Vec::with_capacity(contenders);
    for id in 0..contenders {
        let session = Arc::new(ensemble.connect());
        let options = LockOptions::new(root.as_str()).with_identifier(format!("contender-{}", id));
        let lock = LockController::new(session.clone(), options)?;
        let sim = sim.clone();
        let start = start.clone();

        handles.push(thread::spawn(move || {
            start.wait();
            run_contender(&sim, id, lock, &session)
        }));
    }

    let mut held = 0;
    let mut timed_out = 0;
    let mut lost = 0;
    for handle in handles {
        let result = handle
            .join()
            .map_err(|_| LockError::store_fatal(root.as_str(), "contender thread panicked"))??;
        match result {
            ContenderResult::Held => held += 1,
            ContenderResult::TimedOut => timed_out += 1,
            ContenderResult::SessionLost => lost += 1,
        }
    }

    let leftover = ensemble.children_of(&root).len();
    if !quiet {
        println!(
            "held: {}, timed out: {}, session lost: {}, queue entries left: {}",
            held, timed_out, lost, leftover
        );
    }

    if leftover > 0 {
        return Err(LockError::store_fatal(
            root,
            format!("{} queue entries left behind", leftover),
        ));
    }
    if timed_out > 0 {
        return Err(LockError::Timeout {
            root,
            duration: strategy.budget().unwrap_or_default(),
        });
    }
    Ok(())
}

fn run_contender(
    sim: &Simulation,
    id: usize,
    mut lock: LockController<seqlock::MemorySession>,
    session: &seqlock::MemorySession,
) -> Result<ContenderResult> {
    if lock.acquire_with(sim.strategy)? == AcquireOutcome::TimedOut {
        debug!("contender {} timed out", id);
        return Ok(ContenderResult::TimedOut);
    }

    if sim.in_critical.swap(true, Ordering::SeqCst) {
        return Err(LockError::store_fatal(
            sim.root.as_str(),
            "two contenders held the lock at once",
        ));
    }
    let ticket = sim.ticket.fetch_add(1, Ordering::SeqCst);

    if sim.expire_holder && !sim.expired.swap(true, Ordering::SeqCst) {
        if !sim.quiet {
            println!("{}: contender {} lost its session while holding the lock", ticket, id);
        }
        sim.in_critical.store(false, Ordering::SeqCst);
        session.expire();
        // The handle is failed; release must report it as not held.
        return match lock.release()? {
            ReleaseOutcome::NotHeld => Ok(ContenderResult::SessionLost),
            ReleaseOutcome::Released => Err(LockError::store_fatal(
                sim.root.as_str(),
                "released a lock whose session had expired",
            )),
        };
    }

    let hold = random_hold(sim.min_hold, sim.max_hold);
    thread::sleep(hold);
    if !sim.quiet {
        println!("{}: contender {} held lock for {}ms", ticket, id, hold.as_millis());
    }
    sim.in_critical.store(false, Ordering::SeqCst);

    lock.release()?.into_result(&sim.root)?;
    Ok(ContenderResult::Held)
}

fn random_hold(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}
