//! Serves metrics on `0.0.0.0:1608/metrics` and pushes them to a push gateway on
//! `127.0.0.1:9091` every ten seconds.
use std::thread;
use std::time::Duration;

use metrics_exporter_pushgateway::{PromEntryBuilder, PushGatewayBuilder};
use quanta::Clock;

fn main() {
    tracing_subscriber::fmt::init();

    let publisher = PushGatewayBuilder::new()
        .with_interval(Duration::from_secs(10))
        .with_remote_address("127.0.0.1:9091")
        .with_job_name("example")
        .with_grouping_label("instance", "local")
        .build()
        .expect("failed to build push gateway publisher");

    let entry = PromEntryBuilder::new().with_name("example").with_pusher(publisher).build();

    // Registering metrics ahead of using them is required: the set only hands out handles for
    // metrics it knows about.
    let set = entry.metrics_set("tcp", "server");
    set.register_counter("loops", &["system"]).expect("failed to register counter");
    set.register_histogram("loop_delta_seconds", None, &["system"])
        .expect("failed to register histogram");
    set.register_gauge("lucky_iterations", &[]).expect("failed to register gauge");

    let address = entry.bootstrap().expect("failed to start metrics entry");
    tracing::info!(%address, entry = %entry, "metrics entry started");

    let loops = set.get_counter_with_values("loops", &["foo"]).expect("counter is registered");
    let delta = set
        .get_histogram_with_values("loop_delta_seconds", &["foo"])
        .expect("histogram is registered");
    let lucky = set.get_gauge_with_values("lucky_iterations", &[]).expect("gauge is registered");

    let clock = Clock::new();
    let mut last = None;

    // Loop over and over, pretending to do some work.
    loop {
        loops.increment(1);

        if let Some(t) = last {
            let elapsed: Duration = clock.now() - t;
            delta.record(elapsed.as_secs_f64());
        }

        if clock.raw() % 4 != 0 {
            lucky.increment(1.0);
        } else {
            lucky.decrement(1.0);
        }

        last = Some(clock.now());

        thread::sleep(Duration::from_millis(750));
    }
}
