use std::{error::Error, io::BufRead, time::Duration};

use clap::Parser;
use msgpipe::Client;

#[derive(Debug, Parser)]
struct Cli {
    /// Well-known pipe name of the server
    #[arg(default_value = "msgpipe_echo")]
    pipe_name: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client: Client<String> = Client::new(&cli.pipe_name);

    client.on_connected(|_| println!("connected, type a line to send it (.exit to quit)"));
    client.on_disconnected(|_| println!("disconnected, retrying"));
    client.on_server_message(|_, message| println!("{message}"));
    client.on_error(|error| eprintln!("error: {error}"));

    client.set_reconnect_delay(Duration::from_millis(500));
    client.start();
    client.wait_for_connection();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line == ".exit" {
            break;
        }
        client.push_message(line);
    }

    client.stop();
    client.wait_for_disconnection_timeout(Duration::from_secs(2));
    Ok(())
}
