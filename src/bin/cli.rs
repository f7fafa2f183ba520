use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use redline::{Batch, Client, Command, Config, Error, Frame, ReplyKind, Transaction};
use tokio::net::TcpStream;
use tracing::{debug, info};

const PORT: u16 = 6379;

#[derive(Parser, Debug)]
#[command(about = "Send commands to a RESP server, one at a time, pipelined or as a transaction")]
struct Args {
    /// The host to connect to
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "REDLINE_HOST")]
    host: String,

    /// The port to connect to
    #[arg(short, long, default_value_t = PORT, env = "REDLINE_PORT")]
    port: u16,

    /// Round trips allowed in flight at once
    #[arg(long, default_value_t = 16)]
    max_in_flight: usize,

    /// How long to wait for an in-flight permit, in milliseconds
    #[arg(long, default_value_t = 5000)]
    gate_timeout_ms: u64,

    /// Send all commands as one pipeline
    #[arg(long, conflicts_with = "transaction")]
    pipeline: bool,

    /// Wrap all commands in MULTI/EXEC
    #[arg(long)]
    transaction: bool,

    /// Keys to WATCH before the transaction
    #[arg(long, requires = "transaction")]
    watch: Vec<String>,

    /// Command words. Separate several commands with `;`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    let config = Config {
        max_in_flight: args.max_in_flight,
        gate_timeout: Duration::from_millis(args.gate_timeout_ms),
        ..Config::default()
    };

    let commands: Vec<Command> = args
        .command
        .split(|word| word == ";")
        .filter(|words| !words.is_empty())
        .map(|words| Command::new(&words[0]).args(&words[1..]))
        .collect();

    let stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    info!("Connected to {}", stream.peer_addr()?);
    let client = Client::new(stream, config);

    if args.transaction {
        let transaction = Transaction::new();
        transaction.watch(&args.watch)?;
        let replies = commands
            .into_iter()
            .map(|command| transaction.expect(command, ReplyKind::Any))
            .collect::<Result<Vec<_>, _>>()?;

        if !client.commit(&transaction).await? {
            println!("(transaction aborted)");
            return Ok(());
        }
        join_all(replies).await.into_iter().for_each(print_outcome);
    } else if args.pipeline {
        let batch = Batch::new();
        let replies = commands
            .into_iter()
            .map(|command| batch.expect(command, ReplyKind::Any))
            .collect::<Result<Vec<_>, _>>()?;

        client.execute(&batch).await?;
        join_all(replies).await.into_iter().for_each(print_outcome);
    } else {
        for command in commands {
            match client.send(command, ReplyKind::Any).await {
                Ok(frame) => print_frame(&frame, 0),
                Err(redline::ClientError::Command(err)) => println!("(error) {}", err),
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(())
}

fn print_outcome(outcome: redline::reply::Outcome) {
    match outcome {
        Ok(frame) => print_frame(&frame, 0),
        Err(err) => println!("(error) {}", err),
    }
}

fn print_frame(frame: &Frame, indent: usize) {
    let pad = " ".repeat(indent);
    match frame {
        Frame::Simple(s) => println!("{}{}", pad, s),
        Frame::Error(s) => println!("{}(error) {}", pad, s),
        Frame::Integer(i) => println!("{}(integer) {}", pad, i),
        Frame::Bulk(bytes) => println!("{}\"{}\"", pad, String::from_utf8_lossy(bytes)),
        Frame::NullBulk | Frame::NullArray => println!("{}(nil)", pad),
        Frame::Array(items) if items.is_empty() => println!("{}(empty array)", pad),
        Frame::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                println!("{}{})", pad, i + 1);
                print_frame(item, indent + 2);
            }
        }
    }
}
