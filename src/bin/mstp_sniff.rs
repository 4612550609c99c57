use std::error::Error;
use std::thread;
use std::time::Duration;

use mstp_link::{Link, LinkConfig, Role, SerialTransport};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

fn sniff(port: &str, baud_rate: u32) -> Result<(), Box<dyn Error>> {
    let transport = SerialTransport::open(port, baud_rate)?;
    let config = LinkConfig::default().with_baud_rate(baud_rate);
    // Sniffers never transmit, the station address is irrelevant.
    let link = Link::new("sniff", 254, Role::Sniffer, config, transport)?;
    link.resume();
    println!("Sniffing {} at {} baud", port, baud_rate);

    loop {
        thread::sleep(REPORT_INTERVAL);
        println!("--- link\n{}", link.stats(true));
        println!("--- transceiver\n{}", link.comm_stats(true));
        let masters: Vec<String> = link.netmap().iter().map(|a| a.to_string()).collect();
        println!("masters: {}", masters.join(" "));
        for (address, frames) in link.active() {
            println!("  {:>3}: {} frames", address, frames);
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let baud_rate = match args.next() {
        Some(baud) => baud.parse()?,
        None => 38400,
    };
    sniff(&port, baud_rate)
}
