//! End-to-end check of the master propagation switch.
//!
//! Lives in its own test binary: the configuration is process-global, and
//! the other suites assume it is enabled.

#[macro_use]
mod common;

use ambit::{config, context, wrap_task, Carrier, ContextKey, PropagationConfig};
use common::*;
use std::sync::LazyLock;

static TRACE: LazyLock<ContextKey<String>> = LazyLock::new(|| ContextKey::new("config.trace"));

#[test]
fn master_switch_disables_capture() {
    init_test_logging();
    test_phase!("master_switch_disables_capture");

    test_section!("disabled");
    config::install(PropagationConfig::new().with_enabled(false));
    let carrier = context::bind(&TRACE, "invisible".to_string(), Carrier::capture);
    assert_with_log!(carrier.is_empty(), "disabled capture is empty", true, carrier.is_empty());

    let wrapped = context::bind(&TRACE, "invisible".to_string(), || {
        wrap_task(|| context::is_bound(&TRACE))
    });
    let observed = wrapped();
    assert_with_log!(!observed, "disabled wrap propagates nothing", false, observed);

    test_section!("re-enabled");
    config::install(PropagationConfig::default());
    let carrier = context::bind(&TRACE, "visible".to_string(), Carrier::capture);
    assert_with_log!(carrier.binding_count() >= 1, "enabled capture records", 1, carrier.binding_count());
    let seen = carrier.restore(|| (*context::get(&TRACE).expect("restored")).clone());
    assert_with_log!(seen == "visible", "enabled restore observes", "visible", seen);

    test_complete!("master_switch_disables_capture");
}
