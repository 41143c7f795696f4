//! One-time connectivity check performed before the pipeline is armed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::capture::source::redact;
use crate::capture::StreamBackend;
use crate::control::PtzControl;
use crate::error::CaptureError;
use crate::Config;

/// Extra time granted to a probe that is blocked inside the backend.
const GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightStatus {
    Ok,
    ConfigInvalid,
    RtspUnreachable,
    RtspNoData,
    AuthFailed,
}

impl PreflightStatus {
    pub fn code(&self) -> &'static str {
        match self {
            PreflightStatus::Ok => "ok",
            PreflightStatus::ConfigInvalid => "config_invalid",
            PreflightStatus::RtspUnreachable => "rtsp_unreachable",
            PreflightStatus::RtspNoData => "rtsp_no_data",
            PreflightStatus::AuthFailed => "auth_failed",
        }
    }

    /// Remediation hint for the operator.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            PreflightStatus::Ok => None,
            PreflightStatus::ConfigInvalid => {
                Some("set camera host, username and password (file or CAMPIPE_CAMERA__* variables)")
            }
            PreflightStatus::RtspUnreachable => {
                Some("check that the camera is powered, reachable and that RTSP is enabled")
            }
            PreflightStatus::RtspNoData => {
                Some("the stream opened but delivered no frames; check the stream path and codec")
            }
            PreflightStatus::AuthFailed => Some("check the camera account credentials"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub status: PreflightStatus,
    pub detail: Option<String>,
    pub hint: Option<&'static str>,
}

impl PreflightReport {
    fn new(status: PreflightStatus, detail: Option<String>) -> Self {
        Self {
            status,
            detail,
            hint: status.hint(),
        }
    }

    pub fn ok() -> Self {
        Self::new(PreflightStatus::Ok, None)
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self::new(PreflightStatus::RtspUnreachable, Some(detail.into()))
    }

    pub fn is_ok(&self) -> bool {
        self.status == PreflightStatus::Ok
    }
}

/// Connect and wait for one non-empty frame, bounded by `deadline`.
fn probe_stream(
    mut backend: Box<dyn StreamBackend>,
    uri: &str,
    deadline: Instant,
    connected: &AtomicBool,
) -> PreflightReport {
    if let Err(e) = backend.connect(uri) {
        return PreflightReport::new(PreflightStatus::RtspUnreachable, Some(e.to_string()));
    }
    if Instant::now() > deadline {
        backend.release();
        return PreflightReport::new(
            PreflightStatus::RtspUnreachable,
            Some("stream opened after the timeout".into()),
        );
    }
    connected.store(true, Ordering::Release);

    let mut last_error = None;
    let report = loop {
        if Instant::now() > deadline {
            break PreflightReport::new(PreflightStatus::RtspNoData, last_error);
        }
        match backend.read_frame() {
            Ok(Some(frame)) if !frame.is_empty() => break PreflightReport::ok(),
            Ok(Some(_)) => last_error = Some("only empty frames received".into()),
            Ok(None) => {
                break PreflightReport::new(
                    PreflightStatus::RtspNoData,
                    Some("stream ended before the first frame".into()),
                )
            }
            Err(e @ CaptureError::Timeout(_)) => last_error = Some(e.to_string()),
            Err(e) => break PreflightReport::new(PreflightStatus::RtspNoData, Some(e.to_string())),
        }
    };

    backend.release();
    report
}

/// Validate config, probe the stream and check control credentials, in that order.
///
/// `open` is only called once the configuration is known to be complete.
#[instrument(skip_all)]
pub async fn run_preflight<F>(config: &Config, open: F, control: &PtzControl) -> PreflightReport
where
    F: FnOnce(&str) -> Result<Box<dyn StreamBackend>, CaptureError>,
{
    if let Err(e) = config.camera.validate() {
        warn!(error = %e, "pre-flight: configuration invalid");
        return PreflightReport::new(PreflightStatus::ConfigInvalid, Some(e.to_string()));
    }

    let uri = config.camera.stream_url();
    let backend = match open(&uri) {
        Ok(backend) => backend,
        Err(e) => {
            warn!(uri = %redact(&uri), error = %e, "pre-flight: no backend for stream");
            return PreflightReport::unreachable(e.to_string());
        }
    };
    let timeout = Duration::from_millis(config.preflight.timeout_ms);
    let connected = Arc::new(AtomicBool::new(false));

    let probe = {
        let uri = uri.clone();
        let connected = connected.clone();
        let deadline = Instant::now() + timeout;
        tokio::task::spawn_blocking(move || probe_stream(backend, &uri, deadline, &connected))
    };

    // A backend stuck in connect or read is abandoned to the blocking pool
    let report = match tokio::time::timeout(timeout + GRACE, probe).await {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => PreflightReport::new(PreflightStatus::RtspUnreachable, Some(e.to_string())),
        Err(_) if connected.load(Ordering::Acquire) => PreflightReport::new(
            PreflightStatus::RtspNoData,
            Some(format!("no frame within {:?}", timeout)),
        ),
        Err(_) => PreflightReport::new(
            PreflightStatus::RtspUnreachable,
            Some(format!("stream did not open within {:?}", timeout)),
        ),
    };

    if !report.is_ok() {
        warn!(uri = %redact(&uri), status = report.status.code(), detail = ?report.detail, "pre-flight: stream check failed");
        return report;
    }

    if let PtzControl::Configured(control) = control {
        let control = control.clone();
        let auth = tokio::task::spawn_blocking(move || control.authenticate()).await;
        let failure = match auth {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(detail) = failure {
            warn!(detail = %detail, "pre-flight: camera control authentication failed");
            return PreflightReport::new(PreflightStatus::AuthFailed, Some(detail));
        }
    }

    info!(uri = %redact(&uri), "pre-flight passed");
    PreflightReport::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, SyntheticSource};
    use crate::control::{CameraControl, ControlFailure};

    /// Backend that connects (or not) and then never produces a frame.
    struct Silent {
        connect_ok: bool,
        connect_delay: Duration,
        end_of_stream: bool,
    }

    impl Silent {
        fn new(connect_ok: bool) -> Self {
            Self {
                connect_ok,
                connect_delay: Duration::ZERO,
                end_of_stream: false,
            }
        }
    }

    impl StreamBackend for Silent {
        fn connect(&mut self, uri: &str) -> Result<(), CaptureError> {
            std::thread::sleep(self.connect_delay);
            if self.connect_ok {
                Ok(())
            } else {
                Err(CaptureError::Connect {
                    uri: uri.into(),
                    reason: "connection refused".into(),
                })
            }
        }

        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.end_of_stream {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
            Err(CaptureError::Timeout(Duration::from_millis(10)))
        }

        fn release(&mut self) {}
    }

    struct Credentials(bool);

    impl CameraControl for Credentials {
        fn authenticate(&self) -> Result<(), ControlFailure> {
            if self.0 {
                Ok(())
            } else {
                Err(ControlFailure("401 unauthorized".into()))
            }
        }

        fn move_by(&self, _: i32, _: i32) -> Result<(), ControlFailure> {
            Ok(())
        }
    }

    fn config(timeout_ms: u64) -> Config {
        let mut config = Config::default();
        config.camera.host = "cam.local".into();
        config.camera.username = "admin".into();
        config.camera.password = "secret".into();
        config.camera.stream_uri = "stub://yard".into();
        config.preflight.timeout_ms = timeout_ms;
        config
    }

    fn boxed(backend: impl StreamBackend + 'static) -> Result<Box<dyn StreamBackend>, CaptureError> {
        Ok(Box::new(backend))
    }

    #[tokio::test]
    async fn incomplete_config_is_reported_before_any_connection() {
        let report = run_preflight(
            &Config::default(),
            |_: &str| -> Result<Box<dyn StreamBackend>, CaptureError> {
                panic!("backend must not be opened")
            },
            &PtzControl::NotConfigured,
        )
        .await;

        assert_eq!(report.status, PreflightStatus::ConfigInvalid);
        assert!(report.detail.unwrap().contains("camera.host"));
        assert!(report.hint.is_some());
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let report = run_preflight(
            &config(500),
            |_: &str| boxed(Silent::new(false)),
            &PtzControl::NotConfigured,
        )
        .await;
        assert_eq!(report.status, PreflightStatus::RtspUnreachable);
    }

    #[tokio::test]
    async fn missing_backend_is_unreachable() {
        let report = run_preflight(
            &config(500),
            |uri: &str| Err(CaptureError::Unsupported(uri.into())),
            &PtzControl::NotConfigured,
        )
        .await;
        assert_eq!(report.status, PreflightStatus::RtspUnreachable);
    }

    #[tokio::test]
    async fn hanging_connect_times_out_as_unreachable() {
        let backend = Silent {
            connect_delay: Duration::from_millis(1500),
            ..Silent::new(true)
        };
        let started = Instant::now();
        let report =
            run_preflight(&config(100), |_: &str| boxed(backend), &PtzControl::NotConfigured).await;

        assert_eq!(report.status, PreflightStatus::RtspUnreachable);
        assert!(started.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn open_stream_without_frames_is_no_data() {
        let report = run_preflight(
            &config(150),
            |_: &str| boxed(Silent::new(true)),
            &PtzControl::NotConfigured,
        )
        .await;
        assert_eq!(report.status, PreflightStatus::RtspNoData);
    }

    #[tokio::test]
    async fn immediate_end_of_stream_is_no_data() {
        let backend = Silent {
            end_of_stream: true,
            ..Silent::new(true)
        };
        let report =
            run_preflight(&config(500), |_: &str| boxed(backend), &PtzControl::NotConfigured).await;
        assert_eq!(report.status, PreflightStatus::RtspNoData);
    }

    #[tokio::test]
    async fn streaming_source_passes() {
        let report = run_preflight(
            &config(1000),
            |_: &str| boxed(SyntheticSource::new(32, 24)),
            &PtzControl::NotConfigured,
        )
        .await;
        assert!(report.is_ok());
        assert_eq!(report.hint, None);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_after_stream_check() {
        let control = PtzControl::new(Arc::new(Credentials(false)));
        let report = run_preflight(
            &config(1000),
            |_: &str| boxed(SyntheticSource::new(32, 24)),
            &control,
        )
        .await;
        assert_eq!(report.status, PreflightStatus::AuthFailed);
        assert_eq!(report.status.code(), "auth_failed");

        let control = PtzControl::new(Arc::new(Credentials(true)));
        let report = run_preflight(
            &config(1000),
            |_: &str| boxed(SyntheticSource::new(32, 24)),
            &control,
        )
        .await;
        assert!(report.is_ok());
    }
}
