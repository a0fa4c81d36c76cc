use std::{
    error::Error,
    sync::mpsc,
    time::Duration,
};

use clap::Parser;
use msgpipe::Server;

#[derive(Debug, Parser)]
struct Cli {
    /// Well-known pipe name to serve on
    #[arg(default_value = "msgpipe_echo")]
    pipe_name: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server: Server<String> = Server::new(&cli.pipe_name);

    server.on_client_connected(|conn| println!("{} connected", conn.name()));
    server.on_client_disconnected(|conn| println!("{} disconnected", conn.name()));
    server.on_error(|error| eprintln!("error: {error}"));
    server.on_client_message({
        let server = server.clone();
        move |conn, message| {
            println!("{}: {message}", conn.name());
            server.push_message_to(format!("echo: {message}"), conn.id());
        }
    });

    server.start();
    println!("serving on {}, press Ctrl-C to stop", cli.pipe_name);

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    stop_rx.recv()?;

    println!("stopping");
    server.stop();
    // Give in-flight teardown a moment before the process exits.
    std::thread::sleep(Duration::from_millis(100));
    Ok(())
}
