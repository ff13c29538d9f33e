//! Session output logging in `script(1)`/`scriptreplay(1)` format.
//!
//! Two files per session under `<base>/<YYYY>/<MM>/<DD>/`:
//!   - `typescript-<session_id>-<suffix>`: the raw output byte stream,
//!     framed by the header/footer lines `script(1)` writes (replay tools
//!     skip the header line).
//!   - the same name plus `.timing`: one `<delta-seconds> <bytes>` row per
//!     output chunk, deltas from a monotonic clock.
//!
//! Replay with: `scriptreplay --timing=<file>.timing <file>`
//!
//! A date change rotates to a new directory. Logging is best-effort: the
//! first I/O error is logged and disables the logger for the rest of the
//! session, never the data path.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{Local, NaiveDate};
use rand::Rng;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..6).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

pub struct SessionLogger {
    base_dir: PathBuf,
    session_id: String,
    raw: Option<File>,
    timing: Option<File>,
    raw_path: Option<PathBuf>,
    last_instant: Instant,
    current_date: Option<NaiveDate>,
    disabled: bool,
}

impl SessionLogger {
    pub fn new(base_dir: PathBuf, session_id: String) -> Self {
        Self {
            base_dir,
            session_id,
            raw: None,
            timing: None,
            raw_path: None,
            last_instant: Instant::now(),
            current_date: None,
            disabled: false,
        }
    }

    /// Open the log files.
    pub async fn open(&mut self) {
        self.rotate_if_needed().await;
        if !self.disabled {
            info!(session_id = %self.session_id, "session logging started");
        }
    }

    /// Path of the current raw stream file, if logging is active.
    pub fn raw_path(&self) -> Option<&PathBuf> {
        self.raw_path.as_ref()
    }

    /// Record one output chunk with its timing row.
    pub async fn write(&mut self, chunk: &[u8]) {
        if self.disabled {
            return;
        }
        self.rotate_if_needed().await;

        let now = Instant::now();
        let delta = now.duration_since(self.last_instant).as_secs_f64();
        self.last_instant = now;

        let timing_line = format!("{delta:.6} {}\n", chunk.len());
        let result = async {
            if let Some(raw) = self.raw.as_mut() {
                raw.write_all(chunk).await?;
            }
            if let Some(timing) = self.timing.as_mut() {
                timing.write_all(timing_line.as_bytes()).await?;
            }
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(session_id = %self.session_id, error = %e,
                "session log write failed, disabling logging");
            self.disable();
        }
    }

    /// Write the footer and close both files. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.disabled || self.raw.is_none() {
            self.disable();
            return;
        }
        let footer = format!("\nScript done on {}\n", Local::now().date_naive());
        if let Some(raw) = self.raw.as_mut() {
            let _ = raw.write_all(footer.as_bytes()).await;
            let _ = raw.flush().await;
        }
        if let Some(timing) = self.timing.as_mut() {
            let _ = timing.flush().await;
        }
        self.disabled = true;
        self.raw = None;
        self.timing = None;
        info!(session_id = %self.session_id, "session logging stopped");
    }

    fn disable(&mut self) {
        self.disabled = true;
        self.raw = None;
        self.timing = None;
    }

    /// Open fresh files when the date changed or nothing is open yet.
    async fn rotate_if_needed(&mut self) {
        let today = Local::now().date_naive();
        if self.current_date == Some(today) && self.raw.is_some() {
            return;
        }

        self.raw = None;
        self.timing = None;
        self.current_date = Some(today);

        let date_dir = self.base_dir.join(today.format("%Y/%m/%d").to_string());
        let base_name = format!("typescript-{}-{}", self.session_id, random_suffix());
        let raw_path = date_dir.join(&base_name);
        let timing_path = date_dir.join(format!("{base_name}.timing"));

        let result = async {
            fs::create_dir_all(&date_dir).await?;
            let mut raw = File::create(&raw_path).await?;
            let timing = File::create(&timing_path).await?;
            raw.write_all(format!("Script started on {today}\n").as_bytes()).await?;
            Ok::<_, std::io::Error>((raw, timing))
        }
        .await;

        match result {
            Ok((raw, timing)) => {
                debug!(path = %raw_path.display(), "session log files opened");
                self.raw = Some(raw);
                self.timing = Some(timing);
                self.raw_path = Some(raw_path);
                self.last_instant = Instant::now();
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e,
                    "cannot open session log files, disabling logging");
                self.disable();
            }
        }
    }
}
