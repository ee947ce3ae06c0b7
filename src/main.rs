use std::env::set_var;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::{arg, command, ArgAction};
use fork::{fork, Fork};
use log::*;
use nix::sys::signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use rand::Rng;

use mfsmeta::changelog::FileChangelog;
use mfsmeta::store;
use mfsmeta::utils::init_logs;
use mfsmeta::{FsConfig, FsState, Hooks, Master, MetaConfig};

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_: i32) {
    TERMINATE.store(true, Ordering::SeqCst);
}

fn now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

fn install_signals() {
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(signal_handler),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe {
        for s in [signal::SIGINT, signal::SIGTERM] {
            if let Err(e) = signal::sigaction(s, &sig_action) {
                println!("signal set failed, {:?}", e);
            }
        }
    }
}

fn main() -> Result<()> {
    let matches = command!()
        .arg(arg!([datadir] "Data directory (metadata files and changelogs)").default_value("."))
        .arg(arg!(-f --front "Keep master running in front").action(ArgAction::SetTrue).required(false))
        .arg(arg!(-a --auto_restore "Pick the best metadata file and replay changelogs")
            .action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-i --ignore "Ignore consistency problems while restoring")
            .action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-e --empty_start "Start with an empty filesystem (DANGEROUS)")
            .action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    let datadir = PathBuf::from(matches.get_one::<String>("datadir").unwrap());
    std::env::set_current_dir(&datadir)
        .with_context(|| format!("can't enter data directory {:?}", datadir))?;
    let datadir = PathBuf::from(".");

    if !matches.get_flag("front") {
        match fork() {
            Ok(Fork::Parent(child)) => {
                info!("master daemon running at pid: {}", child);
                return Ok(());
            }
            Ok(Fork::Child) => {}
            Err(e) => return Err(anyhow!("fork returns error {}", e)),
        }
    }
    install_signals();

    let fs_cfg = FsConfig::default().sanitize();
    let meta_cfg = MetaConfig::default().sanitize();
    let mut master = Master::new(FsState::new(fs_cfg, Hooks::default()));

    if matches.get_flag("empty_start") {
        warn!("starting with empty metadata");
        master.fs.fs_new(now());
        master.metaversion = 1;
    } else {
        master
            .loadall(&datadir, matches.get_flag("auto_restore"), matches.get_flag("ignore"))
            .context("error loading metadata")?;
    }
    if master.metaid == 0 {
        master.metaid = rand::thread_rng().gen();
        info!("new metadata id: {:X}", master.metaid);
    }
    master.changelog = Box::new(FileChangelog::new(&datadir));
    info!(
        "metadata loaded: version {}, {} inodes, {} directories, {} files",
        master.metaversion, master.fs.nodes_count, master.fs.dirnodes, master.fs.filenodes
    );

    serve(&mut master, &datadir, &meta_cfg)
}

/// The single-threaded reactor: timers drive the sweeps, the quota pass,
/// the changelog rotation and the background dump.
fn serve(master: &mut Master, datadir: &PathBuf, meta_cfg: &MetaConfig) -> Result<()> {
    let mut dump_child: Option<Pid> = None;
    let mut last_second = 0u32;
    let mut last_store_min = u32::MAX;
    let mut last_hour = now() / 3600;

    while !TERMINATE.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        let ts = now();
        if ts == last_second {
            continue;
        }
        last_second = ts;

        // one trash and one sustained bucket per second keeps pauses short
        master.fs_emptytrash(ts);
        master.fs_emptysustained(ts);
        master.fs_freeinodes(ts);
        master.fs_renumerate_edge_test(ts);
        if ts % 60 == 0 {
            master.fs_check_quotas(ts);
            let ops = master.fs_stats();
            if ops.iter().any(|&c| c > 0) {
                info!(
                    "client ops: statfs:{} getattr:{} setattr:{} lookup:{} mkdir:{} rmdir:{} \
                     symlink:{} readlink:{} mknod:{} unlink:{} rename:{} link:{} readdir:{} \
                     open:{} read:{} write:{}",
                    ops[0], ops[1], ops[2], ops[3], ops[4], ops[5], ops[6], ops[7], ops[8],
                    ops[9], ops[10], ops[11], ops[12], ops[13], ops[14], ops[15]
                );
            }
        }
        master.changelog.flush();

        let hour = ts / 3600;
        if hour != last_hour {
            last_hour = hour;
            if let Err(e) = rotate_changelog(master, meta_cfg) {
                warn!("changelog rotation failed: {:#}", e);
            }
        }

        if let Some(pid) = dump_child {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    dump_child = None;
                    if let Err(e) = store::dump_child_exited(code) {
                        error!("{:#}", e);
                        let _ = master.emergency_saves();
                        return Err(e);
                    }
                    info!("store process has finished");
                }
                Ok(WaitStatus::Signaled(..)) => {
                    dump_child = None;
                    let e = store::dump_child_exited(store::DUMP_SIGNALED).unwrap_err();
                    error!("{:#}", e);
                    let _ = master.emergency_saves();
                    return Err(e);
                }
                _ => {}
            }
        }

        let minute = ts / 60;
        if minute != last_store_min
            && dump_child.is_none()
            && store::store_due(ts, meta_cfg.save_freq, meta_cfg.save_offset, meta_cfg.save_offset_local)
        {
            last_store_min = minute;
            match store::storeall_bg(master, datadir, meta_cfg.back_meta_keep_previous) {
                Ok(Some(pid)) => dump_child = Some(Pid::from_raw(pid)),
                Ok(None) => info!("metadata stored in foreground"),
                Err(e) => {
                    error!("can't store metadata - exiting: {:#}", e);
                    let _ = master.emergency_saves();
                    return Err(e);
                }
            }
        }
    }

    info!("terminating: storing metadata");
    master.changelog.flush();
    let code = store::dump_sequence(master, datadir, meta_cfg.back_meta_keep_previous);
    if code != store::DUMP_OK {
        return Err(anyhow!("final metadata store failed (status {})", code));
    }
    info!("all done");
    Ok(())
}

fn rotate_changelog(master: &mut Master, meta_cfg: &MetaConfig) -> Result<()> {
    master.changelog.flush();
    // the sink owns the files; swap it out, rotate, swap back in
    let mut fresh = FileChangelog::new(&PathBuf::from("."));
    fresh.rotate(meta_cfg.back_logs)?;
    master.changelog = Box::new(fresh);
    Ok(())
}
