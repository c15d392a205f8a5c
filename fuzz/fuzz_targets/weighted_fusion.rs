#![no_main]

use std::collections::HashSet;

use libfuzzer_sys::fuzz_target;
use ragfuse_core::candidate::RankInput;
use ragfuse_core::search::{FusionEngine, FusionWeights};

fn list_from(bytes: &[u8], scored: bool) -> RankInput {
    if scored {
        RankInput::Pairs(
            bytes
                .chunks(2)
                .map(|pair| {
                    let id = format!("d{}", pair[0] % 48);
                    let score = match pair.get(1) {
                        Some(0) => f64::NAN,
                        Some(255) => f64::INFINITY,
                        Some(&b) => f64::from(b) / 17.0 - 3.0,
                        None => 0.0,
                    };
                    (id, score)
                })
                .collect(),
        )
    } else {
        RankInput::Ids(bytes.iter().map(|b| format!("d{}", b % 48)).collect())
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let k = u32::from(data[0]) + 1;
    let lambda_lex = f64::from(data[1]) / 255.0;
    let lambda_sem = f64::from(data[2]) / 255.0;
    let Ok(weights) = FusionWeights::new(k, lambda_lex, lambda_sem) else {
        return;
    };
    let engine = match FusionEngine::new(weights) {
        Ok(engine) => engine,
        Err(_) => return,
    };

    let flags = data[3];
    let body = &data[4..];
    let split = body.len() / 2;
    let lexical = list_from(&body[..split], flags & 1 == 1);
    let semantic = list_from(&body[split..], flags & 2 == 2);

    let fused = engine.fuse_detailed(&lexical, &semantic, None);

    let expected: HashSet<String> = lexical
        .to_ranked()
        .into_iter()
        .chain(semantic.to_ranked())
        .map(|p| p.id)
        .collect();
    let got: HashSet<&str> = fused.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(got.len(), fused.len(), "duplicate id in fused output");
    assert_eq!(got.len(), expected.len(), "fused output is not the union of inputs");

    for r in &fused {
        assert!(r.score.is_finite() && r.score >= 0.0, "bad score {r:?}");
        assert!(r.lexical_rank.is_some() || r.semantic_rank.is_some());
    }
    for pair in fused.windows(2) {
        assert!(
            pair[0].score > pair[1].score
                || (pair[0].score == pair[1].score && pair[0].id < pair[1].id),
            "ordering violated: {:?} then {:?}",
            pair[0],
            pair[1]
        );
    }
});
