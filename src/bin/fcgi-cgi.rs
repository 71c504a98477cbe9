//! `fcgi-cgi`: run CGI programs behind a FastCGI socket.
//!
//! Binds the given address, prints one JSON ready line on stdout and serves
//! every accepted connection with its own multiplexer. Logs go to stderr.

#[cfg(unix)]
use clap::Parser;
#[cfg(unix)]
use fcgi_backend::{
    cgi::CgiHandler,
    control::announce_ready,
    protocol::BeginRequest,
    transport::{ListenAddr, Listener},
    MultiplexerBuilder,
};
#[cfg(unix)]
use tracing::Level;
#[cfg(unix)]
use tracing_subscriber::FmtSubscriber;

/// FastCGI backend that executes CGI programs.
#[cfg(unix)]
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on: `host:port` or `unix:/path/to/socket`.
    #[arg(short, long)]
    listen: ListenAddr,

    /// Capacity of each request's inbound queue.
    #[arg(long, default_value_t = 16)]
    queue_capacity: usize,

    /// Open requests per connection before answering OVERLOADED.
    #[arg(long)]
    max_requests: Option<usize>,

    /// Maximum log level written to stderr.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut builder = MultiplexerBuilder::new().queue_capacity(args.queue_capacity);
    if let Some(limit) = args.max_requests {
        builder = builder
            .max_requests(limit)
            .value("FCGI_MAX_REQS", limit.to_string());
    }

    let listener = Listener::bind(&args.listen).await?;
    let local = listener.local_addr()?;
    announce_ready(&local)?;
    tracing::info!("Serving on {}", local);

    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                continue;
            }
        };

        let builder = builder.clone();
        tokio::spawn(async move {
            tracing::info!("Incoming connection");
            let mux = builder.build(stream, |_: &BeginRequest| CgiHandler::new());
            if let Err(e) = mux.run().await {
                tracing::warn!("Connection failed: {}", e);
            }
        });
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("fcgi-cgi is only supported on unix platforms");
    std::process::exit(1);
}
