#![forbid(unsafe_code)]

//! YouTube-facing side of the service: URL validation, the metadata shape the
//! API returns, and the fetchers that talk to yt-dlp (or pretend to, while
//! test mode is on).

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const REFERER: &str = "https://www.youtube.com/";
const DOWNLOAD_FORMAT: &str = "best[height<=720]";
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const PROGRESS_MARKER: &str = "shorts-progress";
const METADATA_TIMEOUT: Duration = Duration::from_secs(120);
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const STDERR_TAIL_LINES: usize = 20;

static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://(www\.)?(youtube\.com/(watch\?v=|embed/|v/)|youtu\.be/|m\.youtube\.com/watch\?v=)([a-zA-Z0-9_-]{11})$",
    )
    .expect("static regex")
});

pub fn validate_youtube_url(url: &str) -> bool {
    YOUTUBE_URL.is_match(url)
}

/// Returns the 11 character video id of a URL accepted by
/// [`validate_youtube_url`].
pub fn extract_video_id(url: &str) -> Option<&str> {
    YOUTUBE_URL
        .captures(url)
        .and_then(|captures| captures.get(4))
        .map(|id| id.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Seconds.
    pub duration: i64,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub upload_date: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("yt-dlp exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("yt-dlp timed out after {0}s")]
    Timeout(u64),
    #[error("could not parse yt-dlp output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("download completed but file name could not be determined")]
    MissingOutput,
    #[error("download cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Receives download progress as a 0-100 percentage.
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Anything able to resolve metadata and download a video.
#[async_trait]
pub trait VideoFetcher: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, FetchError>;

    /// Downloads `url` and returns the path of the finished file. Must return
    /// [`FetchError::Cancelled`] promptly once `cancel` fires.
    async fn download(
        &self,
        url: &str,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError>;
}

/// Subset of `yt-dlp --dump-single-json`. Everything is optional because
/// older uploads may lack fields.
#[derive(Debug, Deserialize)]
struct RawVideoInfo {
    title: Option<String>,
    fulltitle: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<i64>,
    upload_date: Option<String>,
}

impl From<RawVideoInfo> for VideoMetadata {
    fn from(info: RawVideoInfo) -> Self {
        Self {
            title: info.title.or(info.fulltitle).unwrap_or_default(),
            description: info.description,
            duration: info.duration.map(|value| value.round() as i64).unwrap_or(0),
            thumbnail: info.thumbnail,
            uploader: info.uploader.or(info.channel),
            view_count: info.view_count,
            upload_date: info.upload_date.as_deref().map(upload_date_to_iso),
        }
    }
}

/// `20240131` -> `2024-01-31`; anything unparseable passes through.
fn upload_date_to_iso(value: &str) -> String {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| value.trim().to_string())
}

/// Pulls the percentage out of a line emitted by our `--progress-template`.
/// Only the number directly in front of `%` counts; yt-dlp may wrap it in
/// ANSI colour codes.
fn parse_progress_line(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once(PROGRESS_MARKER)?;
    let (before, _) = rest.split_once('%')?;
    let start = before
        .char_indices()
        .rev()
        .take_while(|(_, ch)| ch.is_ascii_digit() || *ch == '.')
        .last()
        .map(|(idx, _)| idx)?;
    let value = before[start..].parse::<f64>().ok()?;
    Some(value.clamp(0.0, 100.0))
}

/// Runs the yt-dlp executable as a subprocess.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    prefix_args: Vec<String>,
    download_dir: PathBuf,
    max_filesize: Option<u64>,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            download_dir: download_dir.into(),
            max_filesize: None,
        }
    }

    pub fn with_max_filesize(mut self, bytes: u64) -> Self {
        self.max_filesize = Some(bytes);
        self
    }

    /// Runs `script` through `sh` instead of executing it directly, which
    /// sidesteps "text file busy" races on freshly written stubs.
    #[cfg(test)]
    fn via_shell(script: &Path, download_dir: &Path) -> Self {
        Self {
            program: PathBuf::from("sh"),
            prefix_args: vec![script.to_string_lossy().into_owned()],
            download_dir: download_dir.to_path_buf(),
            max_filesize: None,
        }
    }

    fn program_label(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Base invocation shared by every call: network options mirror what the
    /// service has always used against YouTube.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .arg("--no-warnings")
            .arg("--no-colors")
            .arg("--socket-timeout")
            .arg("60")
            .arg("--user-agent")
            .arg(USER_AGENT)
            .arg("--referer")
            .arg(REFERER)
            .arg("--extractor-retries")
            .arg("3")
            .arg("--file-access-retries")
            .arg("3")
            .arg("--http-chunk-size")
            .arg("10M")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    pub async fn version(&self) -> Option<String> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(VERSION_TIMEOUT, command.output())
            .await
            .ok()?
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }
}

#[async_trait]
impl VideoFetcher for YtDlp {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, FetchError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-progress")
            .arg(url);

        let output = tokio::time::timeout(METADATA_TIMEOUT, command.output())
            .await
            .map_err(|_| FetchError::Timeout(METADATA_TIMEOUT.as_secs()))?
            .map_err(|source| FetchError::Launch {
                program: self.program_label(),
                source,
            })?;

        if !output.status.success() {
            return Err(FetchError::Failed {
                status: output.status.to_string(),
                stderr: tail_text(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        let info: RawVideoInfo = serde_json::from_slice(&output.stdout)?;
        Ok(info.into())
    }

    async fn download(
        &self,
        url: &str,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        tokio::fs::create_dir_all(&self.download_dir).await?;

        let mut command = self.command();
        command
            .arg("--format")
            .arg(DOWNLOAD_FORMAT)
            .arg("--output")
            .arg(self.download_dir.join(OUTPUT_TEMPLATE))
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(format!(
                "download:{PROGRESS_MARKER} %(progress._percent_str)s"
            ))
            .arg("--print")
            .arg("after_move:filepath")
            .arg("--no-simulate");
        if let Some(max) = self.max_filesize {
            command.arg("--max-filesize").arg(max.to_string());
        }
        command
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| FetchError::Launch {
            program: self.program_label(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(FetchError::MissingOutput)?;
        let stderr = child.stderr.take().ok_or(FetchError::MissingOutput)?;

        // stderr carries error text and, depending on the yt-dlp version,
        // the progress lines too.
        let stderr_progress = progress.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(pct) = parse_progress_line(&line) {
                    stderr_progress(pct);
                    continue;
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut final_path: Option<PathBuf> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!("failed to stop yt-dlp after cancellation: {err}");
                    }
                    stderr_task.abort();
                    return Err(FetchError::Cancelled);
                }
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if let Some(pct) = parse_progress_line(&line) {
                                progress(pct);
                            } else if !line.trim().is_empty() {
                                final_path = Some(PathBuf::from(line.trim()));
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(FetchError::Failed {
                status: status.to_string(),
                stderr: stderr_text,
            });
        }

        let path = final_path.ok_or(FetchError::MissingOutput)?;
        debug!(path = %path.display(), "yt-dlp finished");
        Ok(path)
    }
}

fn tail_text(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Canned responses served while test mode is enabled. Never touches the
/// network; downloads produce a small placeholder file.
#[derive(Debug, Clone)]
pub struct CannedFetcher {
    download_dir: PathBuf,
    step_delay: Duration,
}

impl CannedFetcher {
    pub const PLACEHOLDER_CONTENTS: &'static [u8] = b"test mode placeholder video\n";

    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            step_delay: Duration::from_millis(200),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[async_trait]
impl VideoFetcher for CannedFetcher {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, FetchError> {
        let id = extract_video_id(url).unwrap_or("unknown");
        Ok(VideoMetadata {
            title: format!("Test Video {id}"),
            description: Some("Canned metadata served while test mode is enabled".to_string()),
            duration: 120,
            thumbnail: Some(format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg")),
            uploader: Some("Test Channel".to_string()),
            view_count: Some(1000),
            upload_date: Some("2024-01-01".to_string()),
        })
    }

    async fn download(
        &self,
        url: &str,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        let id = extract_video_id(url).unwrap_or("unknown");
        for step in [0.0, 25.0, 50.0, 75.0] {
            progress(step);
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.step_delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.download_dir.join(format!("test_{id}.mp4"));
        tokio::fs::write(&path, Self::PLACEHOLDER_CONTENTS).await?;
        progress(100.0);
        Ok(path)
    }
}

/// Chooses between the live yt-dlp fetcher and canned data depending on the
/// runtime test-mode flag.
pub struct YouTubeService {
    download_dir: PathBuf,
    live: Arc<dyn VideoFetcher>,
    canned: Arc<dyn VideoFetcher>,
    ytdlp: Option<YtDlp>,
    test_mode: AtomicBool,
}

impl YouTubeService {
    pub fn new(ytdlp: YtDlp, download_dir: impl Into<PathBuf>, test_mode: bool) -> Self {
        let download_dir = download_dir.into();
        Self {
            live: Arc::new(ytdlp.clone()),
            canned: Arc::new(CannedFetcher::new(&download_dir)),
            ytdlp: Some(ytdlp),
            download_dir,
            test_mode: AtomicBool::new(test_mode),
        }
    }

    /// Builds a service around arbitrary fetchers; used to inject stubs.
    pub fn with_fetchers(
        download_dir: impl Into<PathBuf>,
        live: Arc<dyn VideoFetcher>,
        canned: Arc<dyn VideoFetcher>,
        test_mode: bool,
    ) -> Self {
        Self {
            download_dir: download_dir.into(),
            live,
            canned,
            ytdlp: None,
            test_mode: AtomicBool::new(test_mode),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode.load(Ordering::SeqCst)
    }

    pub fn set_test_mode(&self, enabled: bool) {
        let previous = self.test_mode.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "youtube test mode toggled");
        }
    }

    pub fn fetcher(&self) -> Arc<dyn VideoFetcher> {
        if self.test_mode() {
            self.canned.clone()
        } else {
            self.live.clone()
        }
    }

    /// Version of the configured yt-dlp binary, or `None` when it cannot be run.
    pub async fn probe_ytdlp(&self) -> Option<String> {
        match &self.ytdlp {
            Some(ytdlp) => ytdlp.version().await,
            None => None,
        }
    }

    pub async fn ensure_download_dir(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.download_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::tempdir;

    const VIDEO_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    fn install_ytdlp_stub(dir: &Path) -> PathBuf {
        let script_path = dir.join("yt-dlp-stub.sh");
        let script = r#"set -eu
output=""
url=""
mode="download"
while [ $# -gt 0 ]; do
  case "$1" in
    --output) shift; output="$1" ;;
    --dump-single-json) mode="metadata" ;;
    --version) echo "2024.08.06"; exit 0 ;;
    --socket-timeout|--user-agent|--referer|--extractor-retries|--file-access-retries|--http-chunk-size|--format|--progress-template|--print|--max-filesize) shift ;;
    -*) ;;
    *) url="$1" ;;
  esac
  shift
done

case "$url" in
  *FAILFAILFAI*)
    echo "ERROR: [youtube] FAILFAILFAI: Video unavailable" >&2
    exit 1
    ;;
esac

if [ "$mode" = "metadata" ]; then
  cat <<'JSON'
{"id": "dQw4w9WgXcQ", "title": "Stub Title", "description": "Stub description",
 "duration": 212.4, "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/maxresdefault.jpg",
 "uploader": "Stub Channel", "view_count": 42, "upload_date": "20091025"}
JSON
  exit 0
fi

target=$(printf '%s' "$output" | sed 's/%(title)s/Stub Title/; s/%(ext)s/mp4/')
echo "shorts-progress  12.5%"
echo "shorts-progress 100.0%" >&2
printf 'fake' > "$target"
echo "$target"
"#;
        fs::write(&script_path, script).unwrap();
        script_path
    }

    fn collecting_sink() -> (ProgressSink, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |pct| sink_seen.lock().push(pct));
        (sink, seen)
    }

    #[test]
    fn validates_supported_url_shapes() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "http://youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://youtube.com/v/dQw4w9WgXcQ",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
        ] {
            assert!(validate_youtube_url(url), "{url} should be accepted");
            assert_eq!(extract_video_id(url), Some("dQw4w9WgXcQ"));
        }
    }

    #[test]
    fn rejects_foreign_and_malformed_urls() {
        for url in [
            "",
            "not a url",
            "https://vimeo.com/123456789",
            "https://www.youtube.com/watch?v=short",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10",
            "ftp://youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            assert!(!validate_youtube_url(url), "{url} should be rejected");
            assert!(extract_video_id(url).is_none());
        }
    }

    #[test]
    fn progress_lines_are_parsed_and_clamped() {
        assert_eq!(parse_progress_line("shorts-progress  42.5%"), Some(42.5));
        assert_eq!(parse_progress_line("shorts-progress 100.0%"), Some(100.0));
        assert_eq!(parse_progress_line("[download] Destination: x.mp4"), None);
        assert_eq!(parse_progress_line("shorts-progress N/A"), None);
        assert_eq!(
            parse_progress_line("shorts-progress \x1b[0;94m 45.3%\x1b[0m"),
            Some(45.3)
        );
        assert_eq!(parse_progress_line("shorts-progress 7%"), Some(7.0));
    }

    #[test]
    fn raw_info_maps_to_metadata() {
        let info: RawVideoInfo = serde_json::from_str(
            r#"{"fulltitle": "Full", "duration": 59.6, "channel": "Chan", "upload_date": "20240131"}"#,
        )
        .unwrap();
        let metadata = VideoMetadata::from(info);
        assert_eq!(metadata.title, "Full");
        assert_eq!(metadata.duration, 60);
        assert_eq!(metadata.uploader.as_deref(), Some("Chan"));
        assert_eq!(metadata.upload_date.as_deref(), Some("2024-01-31"));
        assert!(metadata.view_count.is_none());
    }

    #[tokio::test]
    async fn ytdlp_metadata_reads_stub_output() {
        let dir = tempdir().unwrap();
        let script = install_ytdlp_stub(dir.path());
        let ytdlp = YtDlp::via_shell(&script, dir.path());

        let metadata = ytdlp.fetch_metadata(VIDEO_URL).await.unwrap();
        assert_eq!(metadata.title, "Stub Title");
        assert_eq!(metadata.duration, 212);
        assert_eq!(metadata.uploader.as_deref(), Some("Stub Channel"));
        assert_eq!(metadata.view_count, Some(42));
        assert_eq!(metadata.upload_date.as_deref(), Some("2009-10-25"));
    }

    #[tokio::test]
    async fn ytdlp_metadata_surfaces_stderr_on_failure() {
        let dir = tempdir().unwrap();
        let script = install_ytdlp_stub(dir.path());
        let ytdlp = YtDlp::via_shell(&script, dir.path());

        let err = ytdlp
            .fetch_metadata("https://youtu.be/FAILFAILFAI")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Failed { .. }));
        assert!(err.to_string().contains("Video unavailable"));
    }

    #[tokio::test]
    async fn ytdlp_download_reports_progress_and_path() {
        let dir = tempdir().unwrap();
        let script = install_ytdlp_stub(dir.path());
        let downloads = dir.path().join("uploads");
        let ytdlp = YtDlp::via_shell(&script, &downloads);
        let (sink, seen) = collecting_sink();

        let path = ytdlp
            .download(VIDEO_URL, sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, downloads.join("Stub Title.mp4"));
        assert!(path.exists());
        let seen = seen.lock().clone();
        assert!(seen.contains(&12.5));
        assert!(seen.contains(&100.0));
    }

    #[tokio::test]
    async fn ytdlp_download_stops_when_cancelled() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("slow-yt-dlp.sh");
        fs::write(&script, "echo \"shorts-progress 3.0%\"\nexec sleep 30\n").unwrap();
        let ytdlp = YtDlp::via_shell(&script, dir.path());
        let (sink, seen) = collecting_sink();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            ytdlp.download(VIDEO_URL, sink, cancel),
        )
        .await
        .expect("download should stop after cancellation");
        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(seen.lock().iter().all(|pct| *pct == 3.0));
    }

    #[tokio::test]
    async fn ytdlp_download_failure_carries_stderr_tail() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("failing-yt-dlp.sh");
        fs::write(
            &script,
            "echo \"shorts-progress 10.0%\" >&2\n\
             echo \"ERROR: [youtube] dQw4w9WgXcQ: Sign in to confirm your age\" >&2\n\
             exit 3\n",
        )
        .unwrap();
        let ytdlp = YtDlp::via_shell(&script, dir.path());
        let (sink, seen) = collecting_sink();

        let err = ytdlp
            .download(VIDEO_URL, sink, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            FetchError::Failed { status, stderr } => {
                assert!(status.contains('3'), "unexpected status {status}");
                assert_eq!(stderr, "ERROR: [youtube] dQw4w9WgXcQ: Sign in to confirm your age");
            }
            other => panic!("expected a failed download, got {other:?}"),
        }
        assert_eq!(seen.lock().as_slice(), &[10.0]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let ytdlp = YtDlp::new(dir.path().join("does-not-exist"), dir.path());
        let err = ytdlp.fetch_metadata(VIDEO_URL).await.unwrap_err();
        assert!(matches!(err, FetchError::Launch { .. }));
        assert!(ytdlp.version().await.is_none());
    }

    #[tokio::test]
    async fn canned_fetcher_writes_placeholder() {
        let dir = tempdir().unwrap();
        let fetcher = CannedFetcher::new(dir.path()).with_step_delay(Duration::ZERO);
        let metadata = fetcher.fetch_metadata(VIDEO_URL).await.unwrap();
        assert_eq!(metadata.title, "Test Video dQw4w9WgXcQ");
        assert_eq!(metadata.duration, 120);

        let (sink, seen) = collecting_sink();
        let path = fetcher
            .download(VIDEO_URL, sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("test_dQw4w9WgXcQ.mp4"));
        assert_eq!(fs::read(&path).unwrap(), CannedFetcher::PLACEHOLDER_CONTENTS);
        assert_eq!(seen.lock().last(), Some(&100.0));
    }

    #[tokio::test]
    async fn canned_fetcher_honours_cancellation() {
        let dir = tempdir().unwrap();
        let fetcher = CannedFetcher::new(dir.path()).with_step_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (sink, _seen) = collecting_sink();
        let err = fetcher.download(VIDEO_URL, sink, cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert!(!dir.path().join("test_dQw4w9WgXcQ.mp4").exists());
    }

    #[tokio::test]
    async fn service_switches_fetcher_with_test_mode() {
        let dir = tempdir().unwrap();
        let script = install_ytdlp_stub(dir.path());
        let service = YouTubeService::with_fetchers(
            dir.path(),
            Arc::new(YtDlp::via_shell(&script, dir.path())),
            Arc::new(CannedFetcher::new(dir.path())),
            false,
        );

        let live = service.fetcher().fetch_metadata(VIDEO_URL).await.unwrap();
        assert_eq!(live.title, "Stub Title");

        service.set_test_mode(true);
        assert!(service.test_mode());
        let canned = service.fetcher().fetch_metadata(VIDEO_URL).await.unwrap();
        assert_eq!(canned.uploader.as_deref(), Some("Test Channel"));
    }

    #[tokio::test]
    async fn service_probes_ytdlp_version() {
        let dir = tempdir().unwrap();
        let script = install_ytdlp_stub(dir.path());
        let service = YouTubeService::new(YtDlp::via_shell(&script, dir.path()), dir.path(), false);
        assert_eq!(service.probe_ytdlp().await.as_deref(), Some("2024.08.06"));
    }
}
