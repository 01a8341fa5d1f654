use std::io;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{Profile, TranscriptLogger};

/// Two minutes of node time per profile.
const CAPTURE_TICKS: u32 = 2_400;

fn main() -> io::Result<()> {
    for profile in Profile::ALL {
        let mut transcript = TranscriptLogger::create(profile)?;
        let summary = session::run_profile(profile, CAPTURE_TICKS, &mut transcript)?;
        println!("{:<15} {summary} -> {}", profile.tag(), profile.log_path());
    }
    Ok(())
}
