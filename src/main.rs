use qafl::config::DEBUG_VAR;
use qafl::engine::MemEngine;
use qafl::ProcessRole;

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::exit;

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::execvp;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "qafl-fsrv",
    about = "Serve the AFL fork server protocol on behalf of a native command."
)]
struct Settings {
    /// Log protocol details to stderr, same as setting AFL_DEBUG.
    #[structopt(short, long)]
    debug: bool,
    /// Command executed in every child.
    #[structopt(parse(from_os_str))]
    target: PathBuf,
    /// Arguments of the command.
    args: Vec<String>,
}

pub fn main() {
    let settings = Settings::from_args();
    let level = if settings.debug || std::env::var_os(DEBUG_VAR).is_some() {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    // stdout belongs to the target.
    simplelog::CombinedLogger::init(vec![simplelog::WriteLogger::new(
        level,
        simplelog::Config::default(),
        std::io::stderr(),
    )])
    .unwrap();

    let (target, argv) = match build_argv(&settings) {
        Some(argv) => argv,
        None => {
            log::error!("arguments must not contain NUL bytes");
            exit(1);
        }
    };

    // native code is never translated, the engine only serves the relay.
    let mut engine = MemEngine::new(Vec::new());
    let mut rt = qafl::init(&mut engine);
    match qafl::forkserver(&mut rt, &mut engine) {
        ProcessRole::Child => log::debug!("child {} running {:?}", std::process::id(), target),
        ProcessRole::Controller => log::debug!("standalone run of {:?}", target),
    }
    // closes the relay, a native target has nothing to report.
    drop(rt);

    // the std runtime ignores SIGPIPE and exec would hand that on to the target.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        log::warn!("failed to restore SIGPIPE: {}", e);
    }
    match execvp(&target, &argv) {
        Ok(never) => match never {},
        Err(e) => {
            log::error!("failed to execute {:?}: {}", target, e);
            exit(127);
        }
    }
}

fn build_argv(settings: &Settings) -> Option<(CString, Vec<CString>)> {
    let target = CString::new(settings.target.as_os_str().as_bytes()).ok()?;
    let mut argv = vec![target.clone()];
    for arg in settings.args.iter() {
        argv.push(CString::new(arg.as_bytes()).ok()?);
    }
    Some((target, argv))
}
