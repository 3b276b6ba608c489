use std::env;
use std::process;

use onesided::{Driver, SoftFabric, TransferConfig, TransferMode};

fn usage(argv0: &str) -> ! {
    eprintln!("usage: {argv0} <mode>\n  mode = \"read\", \"write\"");
    process::exit(1);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        usage(&args[0]);
    }
    let mode: TransferMode = match args[1].parse() {
        Ok(mode) => mode,
        Err(_) => usage(&args[0]),
    };

    // In read mode this is what the client will pull; in write mode it
    // gets overwritten by the client's push.
    let banner = format!("server {} greets you over the fabric", process::id());
    let cfg = TransferConfig::new(mode).with_payload(banner.into_bytes());

    let driver = match Driver::server(SoftFabric::new(), cfg, 0) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("failed to start server: {e}");
            process::exit(1);
        }
    };
    println!("listening on port {}.", driver.local_port());

    match driver.run() {
        Ok(buf) => {
            let text = String::from_utf8_lossy(&buf);
            println!("final scratch buffer: {}", text.trim_end_matches('\0'));
        }
        Err(e) => {
            eprintln!("server failed: {e}");
            process::exit(1);
        }
    }
}
