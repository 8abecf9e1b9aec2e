use criterion::{black_box, criterion_group, criterion_main, Criterion};
use script_rewriter::audio::{split_progress_lines, ProgressParser};
use script_rewriter::llm::text::{ensure_same_opening, extract_response_text, strip_boilerplate};
use serde_json::json;

fn bench_response_handling(c: &mut Criterion) {
    let original = "你好，今天天气不错。我们来聊聊这个产品。它真的很好用！";
    let body = "改写后的文案：今天天气真好，带你看看这款好物。用过的都说好！".repeat(20);

    let standard = json!({ "model": "qwen2:1.5b", "response": body, "done": true });
    c.bench_function("extract_response_field", |b| {
        b.iter(|| black_box(extract_response_text(black_box(&standard))))
    });

    let unusual = json!({ "model": "qwen2:1.5b", "done": true, "answer": body });
    c.bench_function("extract_fallback_field", |b| {
        b.iter(|| black_box(extract_response_text(black_box(&unusual))))
    });

    c.bench_function("strip_and_fix_opening", |b| {
        b.iter(|| {
            let stripped = strip_boilerplate(black_box(&body));
            black_box(ensure_same_opening(original, stripped))
        })
    });
}

fn bench_transcoder_progress(c: &mut Criterion) {
    let mut stderr = Vec::new();
    stderr.extend_from_slice(b"  Duration: 00:10:00.00, start: 0.000000, bitrate: 128 kb/s\n");
    for second in 0..600 {
        stderr.extend_from_slice(
            format!(
                "size=    1024kB time=00:{:02}:{:02}.00 bitrate= 128.0kbits/s speed=50x\r",
                second / 60,
                second % 60
            )
            .as_bytes(),
        );
    }

    c.bench_function("parse_transcoder_progress", |b| {
        b.iter(|| {
            let mut parser = ProgressParser::new().unwrap();
            let mut pending = Vec::new();
            let mut last = None;
            for chunk in stderr.chunks(256) {
                for line in split_progress_lines(&mut pending, chunk) {
                    if let Some(percent) = parser.feed(&line) {
                        last = Some(percent);
                    }
                }
            }
            black_box(last)
        })
    });
}

criterion_group!(benches, bench_response_handling, bench_transcoder_progress);
criterion_main!(benches);
