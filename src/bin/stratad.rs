use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use getopts::Options;

use strata::bus::session::SocketSession;
use strata::memmgr::config::DEFAULT_MAPPED_FILE_DIR;
use strata::memmgr::loader::FileImageLoader;
use strata::memmgr::manager::Memmgr;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the strata zone data manager
fn main() {
    simple_logger::init().expect("Failed to initialize logger");

    let args: Vec<String> = std::env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt("s", "bus-socket", "Path of the message bus socket", "PATH");
    opts.optopt(
        "m",
        "mapped-file-dir",
        "Directory for the mapped segment files",
        "DIRECTORY",
    );
    opts.optopt(
        "z",
        "zones-dir",
        "Directory holding the zone master files",
        "DIRECTORY",
    );

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(&program, opts);
            process::exit(1);
        }
    };

    if matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let Some(socket_path) = matches.opt_str("s") else {
        eprintln!("The message bus socket must be given with -s");
        print_usage(&program, opts);
        process::exit(1);
    };
    let mapped_dir = matches
        .opt_str("m")
        .unwrap_or_else(|| DEFAULT_MAPPED_FILE_DIR.to_string());
    let zones_dir = matches.opt_str("z").unwrap_or_else(|| "zones".to_string());

    log::info!("strata zone data manager starting");

    let session = match SocketSession::connect(Path::new(&socket_path)) {
        Ok(session) => session,
        Err(e) => {
            log::error!("failed to connect to the message bus at {}: {}", socket_path, e);
            process::exit(1);
        }
    };
    let loader = Arc::new(FileImageLoader::new(PathBuf::from(zones_dir)));

    let mut manager = match Memmgr::new(Box::new(session), loader) {
        Ok(manager) => manager,
        Err(e) => {
            log::error!("failed to set up the manager: {}", e);
            process::exit(1);
        }
    };

    let initial_config = serde_json::json!({ "mapped_file_dir": mapped_dir });
    if let Err(e) = manager.setup(&initial_config) {
        log::error!("fatal setup failure: {}", e);
        process::exit(1);
    }

    let result = manager.run();
    manager.shutdown();
    if let Err(e) = result {
        log::error!("manager terminated: {}", e);
        process::exit(1);
    }
    log::info!("strata zone data manager stopped");
}
