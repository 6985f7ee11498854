use clap::Parser;

/// CLI arguments for the relay server.
#[derive(Parser, Debug)]
#[clap(name = "docrelay-server")]
#[clap(about = "Collaborative document edit relay", long_about = None)]
pub struct ServerArgs {
    /// Port to listen on
    #[clap(short, long, default_value = "3000")]
    pub port: u16,

    /// Host to bind to
    #[clap(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Redis URL for snapshots and the ops bus
    #[clap(long, value_name = "URL", default_value = "redis://127.0.0.1/")]
    pub redis_url: String,

    /// Replica identifier (overrides the SERVER_ID environment variable)
    #[clap(long, value_name = "ID")]
    pub server_id: Option<String>,
}

/// CLI arguments for the terminal pad client.
#[derive(Parser, Debug)]
#[clap(name = "docrelay-pad")]
#[clap(about = "Terminal client for the edit relay", long_about = None)]
pub struct PadArgs {
    /// Relay base URL
    #[clap(long, value_name = "URL", default_value = "ws://127.0.0.1:3000")]
    pub server: String,

    /// Document to edit
    #[clap(long, value_name = "DOC_ID")]
    pub doc_id: String,
}
