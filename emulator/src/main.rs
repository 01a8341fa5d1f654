mod session;

use std::env;
use std::io;
use std::process;

use session::{Profile, TranscriptLogger};

/// Ten minutes of node time at the default tick interval.
const DEFAULT_TICKS: u32 = 12_000;

#[derive(Debug)]
struct Options {
    profile: Profile,
    ticks: u32,
}

fn main() -> io::Result<()> {
    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("Usage: node-emulator [--profile <name>] [--ticks <count>]");
        eprintln!(
            "Profiles: {}",
            Profile::ALL.map(Profile::tag).join(", ")
        );
        process::exit(2);
    });

    let mut transcript = TranscriptLogger::create(options.profile)?;
    let summary = session::run_profile(options.profile, options.ticks, &mut transcript)?;

    println!("profile {}: {summary}", options.profile.tag());
    println!("transcript written to {}", options.profile.log_path());
    Ok(())
}

fn parse_options<I>(mut args: I) -> Result<Options, String>
where
    I: Iterator<Item = String>,
{
    let mut options = Options {
        profile: Profile::Healthy,
        ticks: DEFAULT_TICKS,
    };

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let mut value = || {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("Expected value after {flag}"))
        };

        match flag.as_str() {
            "--profile" => options.profile = Profile::from_tag(&value()?)?,
            "--ticks" => {
                let raw = value()?;
                options.ticks = raw
                    .parse()
                    .map_err(|_| format!("Invalid tick count `{raw}`"))?;
            }
            other if !other.starts_with('-') => options.profile = Profile::from_tag(other)?,
            other => return Err(format!("Unknown option `{other}`")),
        }
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Options, String> {
        parse_options(args.iter().map(|arg| (*arg).to_string()))
    }

    #[test]
    fn defaults_to_healthy_profile() {
        let options = parse(&[]).unwrap();
        assert_eq!(options.profile, Profile::Healthy);
        assert_eq!(options.ticks, DEFAULT_TICKS);
    }

    #[test]
    fn accepts_separate_and_inline_values() {
        let options = parse(&["--profile", "stale-link", "--ticks=40"]).unwrap();
        assert_eq!(options.profile, Profile::StaleLink);
        assert_eq!(options.ticks, 40);

        let options = parse(&["flaky-broker"]).unwrap();
        assert_eq!(options.profile, Profile::FlakyBroker);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["--ticks"]).unwrap_err().contains("Expected value"));
        assert!(parse(&["--ticks", "lots"]).unwrap_err().contains("Invalid tick count"));
        assert!(parse(&["--verbose"]).unwrap_err().contains("Unknown option"));
    }
}
