use clap::Parser;

/// `relay-node trusted_host trusted_port mempool_port "Sponsor String"
/// [whitelist_prefix ...]`
///
/// Exits with code 255 if fewer than the four required arguments are given,
/// matching the reference server's `exit(-1)` on argument failure.
#[derive(Parser, Debug)]
#[command(name = "relay-node", version, about = "Relay-network fan-out server")]
pub struct Args {
    /// Host of the trusted upstream source.
    pub trusted_host: String,

    /// Port of the trusted upstream source's block/transaction channel.
    pub trusted_port: u16,

    /// Port of the trusted upstream source's mempool hint channel.
    pub mempool_port: u16,

    /// String opportunistically advertised to peers whose version opts in.
    pub sponsor: String,

    /// Host prefixes allowed to open more than one connection, keyed by
    /// `host:port` instead of bare host.
    #[arg(trailing_var_arg = true)]
    pub whitelist_prefixes: Vec<String>,
}

/// Resolved server configuration, derived once from [`Args`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub trusted_host: String,
    pub trusted_port: u16,
    pub mempool_port: u16,
    pub sponsor: String,
    pub whitelist_prefixes: Vec<String>,
    pub listen_port: u16,
}

impl RelayConfig {
    pub const DEFAULT_LISTEN_PORT: u16 = 8336;

    pub fn from_args(args: Args) -> Self {
        Self {
            trusted_host: args.trusted_host,
            trusted_port: args.trusted_port,
            mempool_port: args.mempool_port,
            sponsor: args.sponsor,
            whitelist_prefixes: args.whitelist_prefixes,
            listen_port: Self::DEFAULT_LISTEN_PORT,
        }
    }

    pub fn is_whitelisted(&self, host: &str) -> bool {
        self.whitelist_prefixes.iter().any(|prefix| host.starts_with(prefix.as_str()))
    }
}
