//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything records. The returned handle
/// renders `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render the Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

pub use fle_core::metrics::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn recorded_metrics_render_in_text_format() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(WS_CONNECTIONS_TOTAL).increment(3);
            metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(2.0);
        });
        let output = render(&handle);
        assert!(output.contains("ws_connections_total 3"), "{output}");
        assert!(output.contains("ws_connections_active 2"), "{output}");
    }
}
