use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use webshot_relay::{
    truncate_chars, AutoscrollSettings, Config, RetryPolicy, ScrapeRequest, ScrollSettle,
    SettleState,
};

#[cfg(feature = "integration_benchmarks")]
use webshot_relay::CaptureService;
#[cfg(feature = "integration_benchmarks")]
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

// === UNIT BENCHMARKS ===

fn benchmark_request_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("scrape_request");
    configure_fast_group(&mut group);

    let body = r#"{
        "url": "https://example.com/article",
        "notify_api": "https://hooks.example.com/screens",
        "viewport_width": 1440,
        "wait_until": "domcontentloaded",
        "screenshot_retries": 3
    }"#;

    group.bench_function("parse_and_validate", |b| {
        b.iter(|| {
            let request: ScrapeRequest = serde_json::from_str(black_box(body)).unwrap();
            black_box(request.validate().is_ok());
        });
    });

    group.finish();
}

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = vec![
        "https://example.com",
        "http://example.com/path?query=value",
        "ftp://example.com",
        "invalid-url",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = webshot_relay::validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_scroll_settle(c: &mut Criterion) {
    let mut group = c.benchmark_group("scroll_settle");
    configure_fast_group(&mut group);

    let settings = AutoscrollSettings::default();

    // Infinite feed that grows for a while, then stops
    group.bench_function("growing_feed", |b| {
        b.iter(|| {
            let mut settle = ScrollSettle::new(&settings, 1080);
            let mut height = 1080;
            loop {
                if settle.rounds() < 20 {
                    height += 800;
                }
                match settle.observe(black_box(height), true) {
                    SettleState::Growing => continue,
                    state => break black_box(state),
                }
            }
        });
    });

    group.finish();
}

fn benchmark_retry_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_plan");
    configure_fast_group(&mut group);

    let policy = RetryPolicy {
        full_page: true,
        retries: 10,
        viewport_fallback: true,
        delay: Duration::ZERO,
    };

    group.bench_function("full_page_flags", |b| {
        b.iter(|| {
            for attempt in 0..black_box(policy).attempts() {
                black_box(policy.full_page_for(attempt));
            }
        });
    });

    group.finish();
}

fn benchmark_response_truncation(c: &mut Criterion) {
    let mut group = c.benchmark_group("notify_response");
    configure_fast_group(&mut group);

    let long_ascii = "x".repeat(50_000);
    let long_unicode = "héllo wörld ".repeat(5_000);

    group.bench_function("truncate_ascii", |b| {
        b.iter(|| black_box(truncate_chars(black_box(&long_ascii), 2000)));
    });

    group.bench_function("truncate_unicode", |b| {
        b.iter(|| black_box(truncate_chars(black_box(&long_unicode), 2000)));
    });

    group.finish();
}

fn benchmark_chrome_args(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    let config = Config::default();
    let request = ScrapeRequest::default();

    group.bench_function("chrome_args", |b| {
        b.iter(|| black_box(webshot_relay::get_chrome_args(&config, request.viewport())));
    });

    group.finish();
}

// === INTEGRATION BENCHMARKS (require Chrome) ===

#[cfg(feature = "integration_benchmarks")]
fn benchmark_real_world_capture(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("real_world_capture");
    configure_fast_group(&mut group);

    let service = CaptureService::new(Config::default());

    for (name, full_page) in [("viewport", false), ("full_page", true)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let request = ScrapeRequest {
                        url: "https://example.com".to_string(),
                        full_page,
                        autoscroll: full_page,
                        timeout_ms: 10_000,
                        ..Default::default()
                    };

                    let success = service.capture_page(&request).await.is_ok();
                    black_box(success);
                })
            });
        });
    }

    group.finish();
}

#[cfg(feature = "integration_benchmarks")]
fn benchmark_concurrent_captures(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("concurrent_captures");
    configure_fast_group(&mut group);

    let service = CaptureService::new(Config {
        max_concurrent_captures: 3,
        ..Default::default()
    });

    group.bench_function("concurrent_3", |b| {
        b.iter(|| {
            rt.block_on(async {
                let requests: Vec<ScrapeRequest> = (0..3)
                    .map(|_| ScrapeRequest {
                        url: "https://example.com".to_string(),
                        full_page: false,
                        autoscroll: false,
                        ..Default::default()
                    })
                    .collect();

                let results = futures::future::join_all(
                    requests.iter().map(|request| service.capture_page(request)),
                )
                .await;

                black_box(results.iter().filter(|r| r.is_ok()).count());
            })
        });
    });

    group.finish();
}

// === BENCHMARK GROUPS ===

criterion_group!(
    unit_benches,
    benchmark_request_parsing,
    benchmark_url_validation,
    benchmark_scroll_settle,
    benchmark_retry_plan,
    benchmark_response_truncation,
    benchmark_chrome_args,
);

#[cfg(feature = "integration_benchmarks")]
criterion_group!(
    integration_benches,
    benchmark_real_world_capture,
    benchmark_concurrent_captures,
);

#[cfg(feature = "integration_benchmarks")]
criterion_main!(unit_benches, integration_benches);

#[cfg(not(feature = "integration_benchmarks"))]
criterion_main!(unit_benches);
