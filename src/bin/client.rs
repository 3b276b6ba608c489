use std::env;
use std::process;

use onesided::{Driver, SoftFabric, TransferConfig, TransferMode};

fn usage(argv0: &str) -> ! {
    eprintln!("usage: {argv0} <mode> <server-address> <server-port>\n  mode = \"read\", \"write\"");
    process::exit(1);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        usage(&args[0]);
    }
    let mode: TransferMode = match args[1].parse() {
        Ok(mode) => mode,
        Err(_) => usage(&args[0]),
    };
    let host = &args[2];
    let port: u16 = match args[3].parse() {
        Ok(port) => port,
        Err(_) => usage(&args[0]),
    };

    // In write mode this is what gets pushed into the server's buffer;
    // in read mode it is overwritten by the pull.
    let message = format!("client {} was here", process::id());
    let cfg = TransferConfig::new(mode).with_payload(message.into_bytes());

    let driver = match Driver::client(SoftFabric::new(), cfg, host, port) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("failed to start client: {e}");
            process::exit(1);
        }
    };

    match driver.run() {
        Ok(buf) => {
            let text = String::from_utf8_lossy(&buf);
            println!("final scratch buffer: {}", text.trim_end_matches('\0'));
        }
        Err(e) => {
            eprintln!("client failed: {e}");
            process::exit(1);
        }
    }
}
