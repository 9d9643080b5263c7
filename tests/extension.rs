use std::sync::Arc;

use sqlite_ai::engine::mock::{MockBackend, MockConfig, MockStats};
use sqlite_ai::host::{Extension, Value};
use sqlite_ai::{Error, ResultCode};

fn extension(config: MockConfig) -> (Extension, Arc<MockStats>) {
    let backend = MockBackend::with_config(config);
    let stats = backend.stats();
    let mut ext = Extension::new(Arc::new(backend));
    ext.call("llm_model_load", &[Value::from("mock://test")])
        .unwrap();
    (ext, stats)
}

fn text(s: &str) -> Value {
    Value::from(s)
}

fn blob(value: Value) -> Vec<u8> {
    match value {
        Value::Blob(bytes) => bytes,
        other => panic!("expected a blob, got {:?}", other),
    }
}

#[test]
fn version_is_reported() {
    let (mut ext, _) = extension(MockConfig::default());
    let v = ext.call("ai_version", &[]).unwrap();
    assert_eq!(v.as_text(), Some(sqlite_ai::VERSION));
}

#[test]
fn teardown_is_idempotent() {
    let (mut ext, _) = extension(MockConfig::default());
    ext.call("llm_context_create", &[]).unwrap();
    ext.call("llm_sampler_create", &[]).unwrap();

    for name in ["llm_sampler_free", "llm_context_free", "llm_model_free"] {
        ext.call(name, &[]).unwrap();
        ext.call(name, &[]).unwrap();
    }

    let session = ext.session();
    assert!(!session.has_model());
    assert!(!session.has_context());
    assert!(!session.has_sampler());
}

#[test]
fn embeddings_are_deterministic() {
    let (mut ext, _) = extension(MockConfig::default());
    ext.call("llm_context_create_embedding", &[]).unwrap();

    let a = blob(ext.call("llm_embed_generate", &[text("the quick brown fox")]).unwrap());
    let b = blob(ext.call("llm_embed_generate", &[text("the quick brown fox")]).unwrap());
    assert_eq!(a, b);
    assert_eq!(a.len(), 8 * 4);
}

#[test]
fn zero_vectors_map_to_midpoints() {
    let (mut ext, _) = extension(MockConfig {
        zero_embedding: true,
        ..MockConfig::default()
    });
    ext.call("llm_context_create_embedding", &[]).unwrap();

    let u8s = blob(
        ext.call(
            "llm_embed_generate",
            &[text("anything"), text("embedding_type=uint8")],
        )
        .unwrap(),
    );
    assert_eq!(u8s, vec![128u8; 8]);

    let i8s = blob(
        ext.call(
            "llm_embed_generate",
            &[text("anything"), text("embedding_type=int8")],
        )
        .unwrap(),
    );
    assert_eq!(i8s, vec![0u8; 8]);
}

#[test]
fn chunked_embedding_matches_single_batch() {
    let input = text("a sentence long enough to span several small batches");

    let (mut small, small_stats) = extension(MockConfig::default());
    small
        .call("llm_context_create_embedding", &[text("batch_size=8")])
        .unwrap();
    let chunked = blob(small.call("llm_embed_generate", &[input.clone()]).unwrap());
    assert!(small_stats.batch_sizes().len() > 1);

    let (mut large, _) = extension(MockConfig::default());
    large.call("llm_context_create_embedding", &[]).unwrap();
    let single = blob(large.call("llm_embed_generate", &[input]).unwrap());

    let floats = |b: &[u8]| -> Vec<f32> {
        b.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    };
    for (x, y) in floats(&chunked).iter().zip(floats(&single)) {
        assert!((x - y).abs() < 1e-5, "{} vs {}", x, y);
    }
}

#[test]
fn empty_input_yields_null() {
    let (mut ext, _) = extension(MockConfig::default());
    ext.call("llm_context_create_embedding", &[]).unwrap();
    assert!(ext.call("llm_embed_generate", &[text("")]).unwrap().is_null());
    assert!(ext.call("llm_embed_generate", &[Value::Null]).unwrap().is_null());
    assert!(ext.call("llm_text_generate", &[text("")]).unwrap().is_null());
}

#[test]
fn null_input_still_checks_arity() {
    let (mut ext, _) = extension(MockConfig::default());
    ext.call("llm_context_create_embedding", &[]).unwrap();

    let err = ext
        .call(
            "llm_embed_generate",
            &[Value::Null, text("a"), text("b"), text("c")],
        )
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Function 'llm_embed_generate' expects 1 or 2 arguments, but 4 were provided."
    );
    assert!(ext
        .call("llm_embed_generate", &[Value::Null, text("json_output=1")])
        .unwrap()
        .is_null());
}

#[test]
fn transcript_cursor_only_moves_forward() {
    let (mut ext, _) = extension(MockConfig::default());
    ext.call("llm_context_create_chat", &[]).unwrap();
    ext.call("llm_chat_create", &[]).unwrap();

    let mut last = 0;
    for turn in ["first", "second", "third"] {
        ext.call("llm_chat_respond", &[text(turn)]).unwrap();
        let prev_len = ext.session().chat().unwrap().prev_len();
        assert!(prev_len >= last);
        last = prev_len;
    }
}

#[test]
fn chat_overflow_is_reported() {
    let (mut ext, _) = extension(MockConfig::default());
    ext.call("llm_context_create_chat", &[text("context_size=96")])
        .unwrap();
    ext.call("llm_chat_create", &[]).unwrap();

    let err = (0..10)
        .find_map(|_| ext.call("llm_chat_respond", &[text("tell me more")]).err())
        .expect("the window should fill up");
    assert_eq!(err.code(), ResultCode::TooBig);
    assert!(err.to_string().contains("Context size exceeded"));
}

#[test]
fn streaming_matches_blocking() {
    let config = MockConfig {
        reply: "Streamed and blocking replies agree: ünïcödé ✓".to_string(),
        ..MockConfig::default()
    };

    let (mut blocking, _) = extension(config.clone());
    blocking.call("llm_context_create_chat", &[]).unwrap();
    blocking.call("llm_sampler_init_dist", &[Value::Integer(42)]).unwrap();
    blocking.call("llm_chat_create", &[]).unwrap();
    let reply = blocking.call("llm_chat_respond", &[text("hi")]).unwrap();

    let (mut streaming, _) = extension(config);
    streaming.call("llm_context_create_chat", &[]).unwrap();
    streaming.call("llm_sampler_init_dist", &[Value::Integer(42)]).unwrap();
    streaming.call("llm_chat_create", &[]).unwrap();
    let rows: Vec<Vec<Value>> = streaming
        .open_table("llm_chat", &[text("hi")])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let streamed: String = rows
        .iter()
        .filter_map(|r| r.first().and_then(Value::as_text))
        .collect();

    assert_eq!(reply.as_text(), Some(streamed.as_str()));
    let history = streaming.session().chat().unwrap().messages().to_vec();
    assert_eq!(history.last().map(|m| m.content.as_str()), Some(streamed.as_str()));
}

#[test]
fn history_round_trips_through_the_store() {
    let (mut ext, _) = extension(MockConfig::default());
    ext.call("llm_context_create_chat", &[]).unwrap();
    ext.call("llm_chat_create", &[]).unwrap();
    ext.call("llm_chat_system_prompt", &[text("Be terse.")])
        .unwrap();
    ext.call("llm_chat_respond", &[text("one")]).unwrap();
    ext.call("llm_chat_respond", &[text("two")]).unwrap();
    let saved = ext.session().chat().unwrap().messages().to_vec();

    let id = ext
        .call("llm_chat_save", &[text("demo"), text("{\"k\":1}")])
        .unwrap();
    ext.call("llm_chat_create", &[]).unwrap();
    assert!(ext.session().chat().unwrap().messages().is_empty());

    ext.call("llm_chat_restore", &[id.clone()]).unwrap();
    assert_eq!(ext.session().chat().unwrap().messages(), saved.as_slice());
    assert_eq!(
        ext.session().chat().unwrap().id().to_string().as_str(),
        id.as_text().unwrap()
    );

    let chats: Vec<_> = ext.open_table("ai_chat_history", &[]).unwrap().collect();
    assert_eq!(chats.len(), 1);
    let messages: Vec<Vec<Value>> = ext
        .open_table("ai_chat_messages", &[])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(messages.len(), saved.len());
    assert_eq!(messages[0][2].as_text(), Some("system"));
    assert_eq!(messages[0][3].as_text(), Some("Be terse."));
}

#[test]
fn malformed_option_pairs_are_ignored() {
    let (mut ext, _) = extension(MockConfig::default());
    ext.call("llm_context_create", &[text("context_size=128,garbage")])
        .unwrap();
    let size = ext.call("llm_context_size", &[]).unwrap();
    assert_eq!(size.as_integer(), Some(128));
}

#[test]
fn adapter_slots_are_bounded() {
    let (mut ext, stats) = extension(MockConfig::default());
    ext.call("llm_context_create", &[]).unwrap();

    for i in 0..8 {
        let path = format!("mock://adapter-{}", i);
        let index = ext
            .call("llm_lora_load", &[Value::from(path), Value::Real(0.5)])
            .unwrap();
        assert_eq!(index.as_integer(), Some(i));
    }
    let err = ext
        .call("llm_lora_load", &[text("mock://one-too-many"), Value::Integer(1)])
        .unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { max: 8 }));
    assert_eq!(stats.active_adapters().len(), 8);
}

#[test]
fn argument_checks_use_host_messages() {
    let (mut ext, _) = extension(MockConfig::default());

    let err = ext.call("llm_context_size", &[Value::Integer(1)]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Function 'llm_context_size' expects 0 arguments, but 1 were provided."
    );

    let err = ext
        .call("llm_sampler_init_temp", &[text("hot")])
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Function 'llm_sampler_init_temp': argument 1 must be of type REAL (got TEXT)."
    );
}

#[test]
fn missing_prerequisites_are_misuse() {
    let backend = MockBackend::new();
    let mut ext = Extension::new(Arc::new(backend));

    let err = ext.call("llm_context_create", &[]).unwrap_err();
    assert_eq!(err.code(), ResultCode::Misuse);
    assert!(err.to_string().contains("llm_model_load()"));

    ext.call("llm_model_load", &[text("mock://m")]).unwrap();
    let err = ext.call("llm_chat_respond", &[text("hi")]).unwrap_err();
    assert_eq!(err.code(), ResultCode::Misuse);
}

#[test]
fn failed_load_is_logged() {
    let mut ext = Extension::new(Arc::new(MockBackend::new()));
    let err = ext
        .call("llm_model_load", &[text("/no/such/model.gguf")])
        .unwrap_err();
    assert!(matches!(err, Error::LoadFailed { .. }));

    let rows: Vec<Vec<Value>> = ext
        .open_table("ai_log", &[])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(rows.iter().any(|r| r[1].as_text() == Some("ERROR")));
}

#[test]
fn model_facts_are_exposed() {
    let (mut ext, _) = extension(MockConfig {
        cls_labels: vec!["neg".to_string(), "pos".to_string()],
        ..MockConfig::default()
    });
    assert_eq!(
        ext.call("llm_model_n_embd", &[]).unwrap().as_integer(),
        Some(8)
    );
    assert_eq!(
        ext.call("llm_model_n_cls_out", &[]).unwrap().as_integer(),
        Some(2)
    );
    assert_eq!(
        ext.call("llm_model_cls_label", &[Value::Integer(1)])
            .unwrap()
            .as_text(),
        Some("pos")
    );
    assert!(ext
        .call("llm_model_cls_label", &[Value::Integer(5)])
        .unwrap()
        .is_null());
    assert_eq!(
        ext.call("llm_model_meta", &[text("general.architecture")])
            .unwrap()
            .as_text(),
        Some("mock")
    );
    assert_eq!(
        ext.call("llm_model_has_decoder", &[]).unwrap().as_integer(),
        Some(1)
    );
}

#[test]
fn text_generation_uses_the_prediction_budget() {
    let (mut ext, _) = extension(MockConfig {
        reply: "generated continuation".to_string(),
        ..MockConfig::default()
    });
    let out = ext
        .call("llm_text_generate", &[text("Once"), text("n_predict=9")])
        .unwrap();
    assert_eq!(out.as_text(), Some("generated"));
}
