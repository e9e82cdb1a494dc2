//! `logging::init` installs the process-wide tracing subscriber, so this test
//! runs in its own test binary to avoid clashing with `#[traced_test]` unit tests.

use sensor_bridge::logging::{init, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn test_init_twice_is_ok() {
    assert!(init(TracingConfig::new(Level::ERROR).with_format(OutputFormat::Compact)).is_ok());
    assert!(init(TracingConfig::default()).is_ok());
}
