use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "palaver-server", about = "Palaver messaging server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/palaver.toml")]
    pub config: String,
}
