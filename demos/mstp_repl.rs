use anyhow::{bail, Context, Result};
use std::io::Write;
use std::iter::Peekable;
use std::str::{FromStr, SplitWhitespace};
use std::time::Duration;

use mstp_link::{Address, FrameType, Link, LinkConfig, Role, SerialTransport, MAX_DATA_LEN};

fn parse_address(arg: &str) -> Result<Address> {
    if arg == "*" {
        return Ok(Address::BROADCAST);
    }
    let a: u8 = arg.parse().context("Bad address")?;
    Address::new(a).context("Bad address")
}

fn cmd_role(args: &mut CmdScanner, link: &Link) -> Result<()> {
    let role = match args.next()? {
        "master" | "m" => Role::Master,
        "slave" | "s" => Role::Slave,
        "sniffer" => Role::Sniffer,
        "none" => Role::None,
        other => bail!("Unknown role {}", other),
    };
    link.set_role(role)?;
    println!("role {}", link.role());
    Ok(())
}

fn cmd_up(link: &Link) -> Result<()> {
    link.resume();
    if link.wait_up(Duration::from_secs(5)) {
        println!("up, next station {}", link.next_station());
    } else {
        println!("not up yet, state {:?}", link.state());
    }
    Ok(())
}

fn cmd_send(args: &mut CmdScanner, link: &Link) -> Result<()> {
    let destination = parse_address(args.next()?)?;
    let expect_reply = args.peek() == Some("?");
    if expect_reply {
        args.next()?;
    }
    let text = args.rest();
    let frame_type = if expect_reply {
        FrameType::BacnetDataExpectingReply
    } else {
        FrameType::BacnetDataNotExpectingReply
    };
    link.send(destination, frame_type, text.as_bytes())?;
    Ok(())
}

fn cmd_recv(link: &Link) -> Result<()> {
    let mut buf = [0; MAX_DATA_LEN];
    let (len, info) = link.recv(&mut buf)?;
    println!(
        "{:?} {} -> {}: {}",
        info.frame_type,
        info.source,
        info.destination,
        String::from_utf8_lossy(&buf[..len])
    );
    Ok(())
}

fn cmd_ping(args: &mut CmdScanner, link: &Link) -> Result<()> {
    let destination = parse_address(args.next()?)?;
    let opcode = args.parse_next().unwrap_or(0);
    let argument = args.parse_next().unwrap_or(0);
    println!("{:?}", link.send_request(destination, opcode, argument, &[])?);
    Ok(())
}

fn cmd_stats(args: &mut CmdScanner, link: &Link) -> Result<()> {
    let reset = args.peek() == Some("reset");
    println!("{}", link.stats(reset));
    println!("{}", link.comm_stats(reset));
    Ok(())
}

fn cmd_netmap(link: &Link) -> Result<()> {
    let masters: Vec<String> = link.netmap().iter().map(|a| a.to_string()).collect();
    println!("masters: {}", masters.join(" "));
    for (address, frames) in link.active() {
        println!("  {:>3}: {} frames", address, frames);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args();
    args.next(); // Skip program name
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let station: u8 = args.next().as_deref().unwrap_or("1").parse()?;
    let baud_rate: u32 = args.next().as_deref().unwrap_or("38400").parse()?;

    let serial = SerialTransport::open(&port, baud_rate).context("Failed to open serial port")?;
    let config = LinkConfig::default().with_baud_rate(baud_rate);
    let link = Link::new("repl", station, Role::Master, config, serial)?;
    let events = link.subscribe();

    let mut stdout = std::io::stdout();
    loop {
        for event in events.try_iter() {
            println!("event: {:?}", event);
        }
        print!(">> ");
        stdout.flush()?;
        let mut cmd = String::new();
        let mut scan = CmdScanner::read_stdin(&mut cmd)?;
        if let Err(err) = match scan.next() {
            Err(_) => continue,
            Ok("role") => cmd_role(&mut scan, &link),
            Ok("up") => cmd_up(&link),
            Ok("down") => {
                link.stop();
                Ok(())
            }
            Ok("send") | Ok("s") => cmd_send(&mut scan, &link),
            Ok("recv") | Ok("r") => cmd_recv(&link),
            Ok("ping") => cmd_ping(&mut scan, &link),
            Ok("stats") => cmd_stats(&mut scan, &link),
            Ok("netmap") => cmd_netmap(&link),
            Ok("quit") | Ok("q") => break,
            Ok(cmd) => {
                println!("Unknown command {}", cmd);
                continue;
            }
        } {
            println!("{:?}", err)
        }
    }
    Ok(())
}

struct CmdScanner<'a> {
    splt: Peekable<SplitWhitespace<'a>>,
}

impl<'a> CmdScanner<'a> {
    fn read_stdin(buf: &'a mut String) -> Result<Self> {
        buf.clear();
        std::io::stdin().read_line(buf)?;
        let splt = buf.split_whitespace().peekable();
        Ok(Self { splt })
    }
    fn next(&mut self) -> Result<&'a str> {
        self.splt.next().context("End of stream")
    }
    fn peek(&mut self) -> Option<&'a str> {
        self.splt.peek().copied()
    }
    fn rest(&mut self) -> String {
        self.splt.by_ref().collect::<Vec<_>>().join(" ")
    }
    fn parse_next<T: FromStr>(&mut self) -> Result<T> {
        self.next()?.parse::<T>().ok().context("Parse error")
    }
}
