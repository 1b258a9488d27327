use std::env;
use std::process;
use std::time::SystemTime;

use domain::adapters::memory_scheduler::RecordingScheduler;
use domain::service::{LinkService, NewLink};
use domain::token::{unix_secs, TokenCodec, DEFAULT_TOKEN_LIFETIME};
use domain::Clock;

const DEV_SECRET: &str = "dev-only-secret-change-me";

struct StdClock;
impl Clock for StdClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

fn print_usage() {
    eprintln!(
        "{}\n\nUsage:\n  domain issue <target_url> <callback_url> <delay_seconds> [--state <s>] [--secret <key>]\n  domain inspect <token> [--secret <key>]\n  domain resolve <token> [--secret <key>]\n\nNotes:\n  - The secret defaults to $LINK_SECRET, then a fixed development key.\n  - `resolve` records the callback it would schedule; nothing is sent.",
        domain::about()
    );
}

/// Split `--flag value` pairs off the argument list.
fn parse_flags(rest: Vec<String>) -> Result<(Vec<String>, Option<String>, Option<String>), String> {
    let mut positional = Vec::new();
    let mut state = None;
    let mut secret = None;
    let mut it = rest.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--state" => state = Some(it.next().ok_or("--state requires a value")?),
            "--secret" => secret = Some(it.next().ok_or("--secret requires a value")?),
            flag if flag.starts_with("--") => return Err(format!("unknown argument: {}", flag)),
            _ => positional.push(arg),
        }
    }
    Ok((positional, state, secret))
}

fn run() -> Result<(), String> {
    let mut args = env::args().skip(1); // skip program name

    let Some(cmd) = args.next() else {
        print_usage();
        return Ok(());
    };
    let (positional, state, secret) = parse_flags(args.collect())?;

    let secret = secret
        .or_else(|| env::var("LINK_SECRET").ok())
        .unwrap_or_else(|| DEV_SECRET.to_string());
    let codec = TokenCodec::new(secret, DEFAULT_TOKEN_LIFETIME)
        .map_err(|e| format!("invalid secret: {}", e))?;
    let scheduler = RecordingScheduler::new();
    let svc = LinkService::new(codec, scheduler.clone(), StdClock);

    match (cmd.as_str(), positional.as_slice()) {
        ("issue", [target, callback, delay]) => {
            let delay_seconds = delay
                .parse::<i64>()
                .map_err(|_| format!("invalid delay: {}", delay))?;
            let issued = svc
                .create(NewLink {
                    target_url: target.clone(),
                    callback_url: callback.clone(),
                    delay_seconds,
                    state,
                })
                .map_err(|e| format!("issue failed: {}", e))?;
            println!("{}", issued.token);
            eprintln!("expires at unix {}", unix_secs(issued.expires_at));
            Ok(())
        }
        ("inspect", [token]) => {
            let p = svc
                .inspect(token)
                .map_err(|e| format!("inspect failed: {}", e))?;
            println!("target_url:    {}", p.target_url);
            println!("callback_url:  {}", p.callback_url);
            println!("delay_seconds: {}", p.delay_seconds);
            println!("issued_at:     unix {}", unix_secs(p.issued_at));
            if let Some(s) = p.state {
                println!("state:         {}", s);
            }
            Ok(())
        }
        ("resolve", [token]) => {
            let redirect = svc
                .resolve(token)
                .map_err(|e| format!("resolve failed: {}", e))?;
            println!("302 -> {}", redirect.target_url);
            for task in scheduler.tasks() {
                println!(
                    "callback {} due at unix {}",
                    task.callback_url,
                    unix_secs(task.fire_at)
                );
            }
            Ok(())
        }
        ("issue" | "inspect" | "resolve", _) => Err(format!("wrong arguments for {}", cmd)),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn main() {
    if let Err(msg) = run() {
        eprintln!("error: {}", msg);
        process::exit(1);
    }
}
