use keel_core::{bind, from_external, join, stringify, to_external, DeferredValue, External, Key, Part, Value};

#[test]
fn keys_render_with_namespace_separator() {
    for (ns, name) in [("aws", "region"), ("app", "port"), ("a", "b/c")] {
        let ext = to_external(&Value::Keyword(Key::namespaced(ns, name)));
        assert_eq!(ext, External::String(format!("{}/{}", ns, name)));
    }
    assert_eq!(to_external(&Value::Keyword(Key::bare("k"))), External::String("k".into()));
}

#[test]
fn join_resolves_in_input_order_for_every_resolution_order() {
    let orders: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    for order in orders {
        let (values, resolvers): (Vec<_>, Vec<_>) = (0..3).map(|_| DeferredValue::<usize>::pending()).unzip();
        let all = join(values);
        let mut resolvers: Vec<_> = resolvers.into_iter().map(Some).collect();
        for (step, idx) in order.iter().enumerate() {
            assert_eq!(all.peek(), None, "partial join observed at step {} of {:?}", step, order);
            if let Some(r) = resolvers[*idx].take() {
                r.resolve(*idx * 10);
            }
        }
        assert_eq!(all.peek(), Some(Ok(vec![0, 10, 20])), "order {:?}", order);
    }
}

#[test]
fn transforms_of_secrets_stay_secret() {
    let s = DeferredValue::secret(7i64);
    let derived = [s.map(|v| v.to_string()).is_secret(), s.map(|_| ()).is_secret(), s.map(|v| v > 0).is_secret()];
    assert!(derived.iter().all(|secret| *secret));
}

#[test]
fn binding_combinator_adds_three_and_four() {
    let (da, ra) = DeferredValue::<i64>::pending();
    let (db, rb) = DeferredValue::<i64>::pending();
    let sum = bind!(a = da, b = db => a + b);
    rb.resolve(4);
    assert_eq!(sum.peek(), None);
    ra.resolve(3);
    assert_eq!(sum.peek(), Some(Ok(7)));
}

#[test]
fn dynamic_binding_matches_typed_form() {
    let sum = keel_core::bind(
        [("a", DeferredValue::known(Value::from(3))), ("b", DeferredValue::known(Value::from(4)))],
        |names| names.value("a").as_i64().unwrap_or(0) + names.value("b").as_i64().unwrap_or(0),
    );
    assert_eq!(sum.peek(), Some(Ok(7)));
}

#[test]
fn stringify_waits_for_every_part() {
    let (host, r) = DeferredValue::<String>::pending();
    let url = stringify([Part::from("https://"), Part::from(&host), Part::from("/health")]);
    assert_eq!(url.peek(), None);
    r.resolve("api.internal".into());
    assert_eq!(url.peek(), Some(Ok("https://api.internal/health".to_string())));
}

#[test]
fn external_round_trip_keeps_plain_data() {
    let v = Value::map([
        ("name", Value::from("web")),
        ("replicas", Value::from(3)),
        ("ports", Value::from(vec![80, 443])),
        ("public", Value::from(false)),
    ]);
    assert_eq!(from_external(&to_external(&v)), v);
}
