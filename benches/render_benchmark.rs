// Criterion benchmark: build and render templates of different shapes.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::hint::black_box as bb;

use tela::{build, BuildOptions, MapFiles, RunOptions, TypeDesc, Value, Vars};

// =============================================================================
// Corpus
// =============================================================================

const SMALL_PAGE: &str = "Hello {{ name }}!";

const MEDIUM_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>{{ title }}</title></head>
<body>
{% if logged %}
<p>Welcome back, {{ name }}.</p>
{% else %}
<p>Please <a href="/login?next={{ next }}">log in</a>.</p>
{% end %}
<ul>
{% for i, item := range items %}
<li id="item-{{ i }}">{{ item }}</li>
{% end %}
</ul>
</body>
</html>
"#;

const LOOP_HEAVY: &str = r#"{% var total = 0 %}
{% for i := 0; i < 1000; i++ %}{% total += i %}{% end %}
{{ total }}"#;

fn options() -> BuildOptions {
    let mut opts = BuildOptions::default();
    opts.globals.add_var("name", TypeDesc::String, Value::str("world"));
    opts.globals.add_var("title", TypeDesc::String, Value::str("bench"));
    opts.globals.add_var("next", TypeDesc::String, Value::str("/a?b=c&d"));
    opts.globals.add_var("logged", TypeDesc::Bool, Value::Bool(true));
    let items = Value::Slice(tela::vm::value::SliceVal::from_vec(
        (0..50).map(|i| Value::str(format!("item {i}"))).collect(),
    ));
    opts.globals.add_var("items", TypeDesc::Slice(Box::new(TypeDesc::String)), items);
    opts
}

fn bench_build(c: &mut Criterion) {
    let opts = options();
    let mut group = c.benchmark_group("build");
    for (name, src) in [("small", SMALL_PAGE), ("medium", MEDIUM_PAGE), ("loop", LOOP_HEAVY)] {
        group.throughput(Throughput::Bytes(src.len() as u64));
        group.bench_function(name, |b| {
            let fs = MapFiles::from_pairs([("index.html", src)]);
            b.iter(|| bb(build(&fs, "index.html", &opts).unwrap()));
        });
    }
    group.finish();
}

fn bench_run(c: &mut Criterion) {
    let opts = options();
    let mut group = c.benchmark_group("run");
    for (name, src) in [("small", SMALL_PAGE), ("medium", MEDIUM_PAGE), ("loop", LOOP_HEAVY)] {
        let fs = MapFiles::from_pairs([("index.html", src)]);
        let template = build(&fs, "index.html", &opts).unwrap();
        group.bench_function(name, |b| {
            b.iter_batched(
                Vec::new,
                |mut out| {
                    template
                        .run(&mut out, &Vars::new(), &RunOptions::default())
                        .unwrap();
                    bb(out)
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_run);
criterion_main!(benches);
