//! Issues a session token the bridge will accept in its WebSocket handshake.
//!
//! Tokens are normally issued by the account service; this is for local
//! development and manual testing against a running bridge.

use clap::Parser;
use domain::jwt::issue_token;
use domain::Identity;

#[derive(Parser)]
#[command(name = "issue_token")]
#[command(about = "Issue a session token for the sensor bridge handshake")]
struct Args {
    /// The userId the token is issued to
    #[arg(long)]
    user_id: String,

    /// Token lifetime in seconds
    #[arg(long, default_value_t = 3600)]
    ttl_secs: i64,

    /// The secret shared with the bridge
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,
}

fn main() {
    let args = Args::parse();

    let identity = match Identity::parse(args.user_id) {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("Invalid user id: {e}");
            std::process::exit(1);
        }
    };

    match issue_token(&args.jwt_secret, &identity, args.ttl_secs) {
        Ok(token) => println!("{token}"),
        Err(e) => {
            eprintln!("Failed to issue token: {e}");
            std::process::exit(1);
        }
    }
}
