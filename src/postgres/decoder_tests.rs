#[cfg(test)]
mod tests {
    use super::super::decoder::Decoder;
    use super::super::pgoutput::PgOutputDecoder;
    use super::super::test_utils::{PgOutputMessageBuilder, TupleValue};
    use super::super::types::{ChangeEvent, ChangeOperation, RelationName};
    use crate::Error;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    const USERS: u32 = 16384;
    const ORDERS: u32 = 16390;

    fn create_decoder() -> PgOutputDecoder {
        PgOutputDecoder::new("walsub_pub")
    }

    fn builder() -> PgOutputMessageBuilder {
        PgOutputMessageBuilder::new()
            .add_relation(
                USERS,
                "public",
                "users",
                vec![("id", 23, true), ("name", 25, false), ("active", 16, false)],
            )
            .add_relation(ORDERS, "sales", "orders", vec![("id", 20, true), ("total", 1700, false)])
    }

    fn decode_change(decoder: &mut PgOutputDecoder, payload: &[u8]) -> ChangeEvent {
        match decoder.decode(payload) {
            Ok(Some(event)) => event,
            other => panic!("Expected a change event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_begin_message() {
        let mut decoder = create_decoder();
        let event = decode_change(&mut decoder, &builder().begin_message(12345));

        assert_eq!(event.op, ChangeOperation::Begin);
        assert_eq!(event.xid, Some(12345));
        assert_eq!(
            event.timestamp,
            Some(Utc.with_ymd_and_hms(2023, 10, 15, 10, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_commit_carries_transaction_xid() {
        let mut decoder = create_decoder();
        let builder = builder();

        decode_change(&mut decoder, &builder.begin_message(777));
        let commit = decode_change(&mut decoder, &builder.commit_message());
        assert_eq!(commit.op, ChangeOperation::Commit);
        assert_eq!(commit.xid, Some(777));

        // the next transaction starts clean
        let commit = decode_change(&mut decoder, &builder.commit_message());
        assert_eq!(commit.xid, None);
    }

    #[test]
    fn test_decode_relation_message() {
        let mut decoder = create_decoder();

        let result = decoder.decode(&builder().relation_message(USERS)).unwrap();
        assert!(result.is_none());

        let relation = decoder.relations().get(USERS).unwrap();
        assert_eq!(relation.name(), RelationName::new("public", "users"));
        assert_eq!(relation.replica_identity, b'd');
        assert_eq!(relation.columns.len(), 3);
        assert!(relation.columns[0].is_key);
        assert_eq!(relation.columns[1].name, "name");
        assert_eq!(relation.columns[2].type_id, 16);
        assert_eq!(relation.columns[2].type_modifier, -1);
    }

    #[test]
    fn test_relation_redefinition_replaces_cache_entry() {
        let mut decoder = create_decoder();
        decoder.decode(&builder().relation_message(USERS)).unwrap();

        let altered = PgOutputMessageBuilder::new().add_relation(
            USERS,
            "public",
            "users",
            vec![("id", 23, true), ("email", 25, false)],
        );
        decoder.decode(&altered.relation_message(USERS)).unwrap();

        assert_eq!(decoder.relations().len(), 1);
        let event = decode_change(
            &mut decoder,
            &altered.insert_message(USERS, &[TupleValue::Text("1"), TupleValue::Text("a@b.c")]),
        );
        assert_eq!(event.columns.get("email"), Some(&json!("a@b.c")));
        assert!(!event.columns.contains_key("name"));
    }

    #[test]
    fn test_decode_insert_message() {
        let mut decoder = create_decoder();
        let builder = builder();

        decoder.decode(&builder.relation_message(USERS)).unwrap();
        decode_change(&mut decoder, &builder.begin_message(100));

        let event = decode_change(
            &mut decoder,
            &builder.insert_message(
                USERS,
                &[TupleValue::Text("1"), TupleValue::Text("Alice"), TupleValue::Text("t")],
            ),
        );

        assert_eq!(event.op, ChangeOperation::Insert);
        assert_eq!(event.relation, Some(RelationName::new("public", "users")));
        assert_eq!(event.xid, Some(100));
        assert_eq!(
            Value::Object(event.columns),
            json!({"id": 1, "name": "Alice", "active": true})
        );
        assert!(event.old_columns.is_none());
    }

    #[test]
    fn test_decode_insert_with_nulls() {
        let mut decoder = create_decoder();
        let builder = builder();
        decoder.decode(&builder.relation_message(USERS)).unwrap();

        let event = decode_change(
            &mut decoder,
            &builder.insert_message(USERS, &[TupleValue::Text("2"), TupleValue::Null, TupleValue::Null]),
        );

        assert_eq!(event.columns.get("id"), Some(&json!(2)));
        assert_eq!(event.columns.get("name"), Some(&Value::Null));
        assert_eq!(event.columns.get("active"), Some(&Value::Null));
    }

    #[test]
    fn test_decode_insert_keeps_numeric_text() {
        let mut decoder = create_decoder();
        let builder = builder();
        decoder.decode(&builder.relation_message(ORDERS)).unwrap();

        let event = decode_change(
            &mut decoder,
            &builder.insert_message(ORDERS, &[TupleValue::Text("9000000000"), TupleValue::Text("19.990")]),
        );

        assert_eq!(event.relation, Some(RelationName::new("sales", "orders")));
        assert_eq!(event.columns.get("id"), Some(&json!(9_000_000_000i64)));
        assert_eq!(event.columns.get("total"), Some(&json!("19.990")));
    }

    #[test]
    fn test_decode_binary_column_as_base64() {
        let mut decoder = create_decoder();
        let builder = PgOutputMessageBuilder::new().add_relation(
            1,
            "public",
            "blobs",
            vec![("id", 23, true), ("data", 17, false)],
        );
        decoder.decode(&builder.relation_message(1)).unwrap();

        let event = decode_change(
            &mut decoder,
            &builder.insert_message(1, &[TupleValue::Text("1"), TupleValue::Binary(&[0xde, 0xad, 0xbe, 0xef])]),
        );

        assert_eq!(event.columns.get("data"), Some(&json!("3q2+7w==")));
    }

    #[test]
    fn test_decode_insert_unknown_relation() {
        let mut decoder = create_decoder();
        let payload = builder().insert_message(99, &[TupleValue::Text("1")]);

        match decoder.decode(&payload) {
            Err(Error::UnknownRelation(id)) => assert_eq!(id, 99),
            other => panic!("Expected UnknownRelation, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_update_with_old_key() {
        let mut decoder = create_decoder();
        let builder = builder();
        decoder.decode(&builder.relation_message(USERS)).unwrap();

        let old = [TupleValue::Text("1"), TupleValue::Null, TupleValue::Null];
        let event = decode_change(
            &mut decoder,
            &builder.update_message(
                USERS,
                Some((&old[..], true)),
                &[TupleValue::Text("10"), TupleValue::Text("Alice"), TupleValue::Text("f")],
            ),
        );

        assert_eq!(event.op, ChangeOperation::Update);
        assert_eq!(
            Value::Object(event.columns),
            json!({"id": 10, "name": "Alice", "active": false})
        );
        let old_columns = event.old_columns.expect("old key");
        assert_eq!(old_columns.get("id"), Some(&json!(1)));
    }

    #[test]
    fn test_decode_update_without_old_tuple() {
        let mut decoder = create_decoder();
        let builder = builder();
        decoder.decode(&builder.relation_message(USERS)).unwrap();

        let event = decode_change(
            &mut decoder,
            &builder.update_message(
                USERS,
                None,
                &[TupleValue::Text("1"), TupleValue::Text("Bob"), TupleValue::UnchangedToast],
            ),
        );

        assert!(event.old_columns.is_none());
        assert_eq!(event.columns.get("name"), Some(&json!("Bob")));
        // unchanged TOAST values are not resent
        assert!(!event.columns.contains_key("active"));
    }

    #[test]
    fn test_decode_delete_message() {
        let mut decoder = create_decoder();
        let builder = builder();
        decoder.decode(&builder.relation_message(USERS)).unwrap();

        let event = decode_change(
            &mut decoder,
            &builder.delete_message(USERS, &[TupleValue::Text("5"), TupleValue::Null, TupleValue::Null]),
        );

        assert_eq!(event.op, ChangeOperation::Delete);
        assert_eq!(event.columns.get("id"), Some(&json!(5)));
        assert!(event.old_columns.is_none());
    }

    #[test]
    fn test_decode_truncate_message() {
        let mut decoder = create_decoder();
        let builder = builder();
        decoder.decode(&builder.relation_message(USERS)).unwrap();
        decoder.decode(&builder.relation_message(ORDERS)).unwrap();

        let event = decode_change(&mut decoder, &builder.truncate_message(&[USERS, ORDERS], true, false));

        assert_eq!(event.op, ChangeOperation::Truncate);
        assert_eq!(
            event.truncated,
            vec![RelationName::new("public", "users"), RelationName::new("sales", "orders")]
        );
        assert_eq!(event.columns.get("cascade"), Some(&json!(true)));
        assert_eq!(event.columns.get("restart_identity"), Some(&json!(false)));
    }

    #[test]
    fn test_decode_logical_message() {
        let mut decoder = create_decoder().with_messages(true);
        let event = decode_change(
            &mut decoder,
            &builder().logical_message(false, "audit", b"user logged in"),
        );

        assert_eq!(event.op, ChangeOperation::Message);
        assert_eq!(event.columns.get("prefix"), Some(&json!("audit")));
        assert_eq!(event.columns.get("content"), Some(&json!("user logged in")));
        assert_eq!(event.columns.get("transactional"), Some(&json!(false)));
    }

    #[test]
    fn test_metadata_messages_produce_nothing() {
        let mut decoder = create_decoder();
        let builder = builder();

        assert!(decoder
            .decode(&builder.type_message(50000, "public", "mood"))
            .unwrap()
            .is_none());
        assert!(decoder.decode(&builder.origin_message("node_a")).unwrap().is_none());
    }

    #[test]
    fn test_column_count_mismatch() {
        let mut decoder = create_decoder();
        let builder = builder();
        decoder.decode(&builder.relation_message(USERS)).unwrap();

        let payload = builder.insert_message(USERS, &[TupleValue::Text("1"), TupleValue::Text("x")]);
        match decoder.decode(&payload) {
            Err(Error::Decode { message, position }) => {
                assert!(message.contains("Column count mismatch"));
                assert_eq!(position, Some(6));
            }
            other => panic!("Expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload() {
        let mut decoder = create_decoder();
        let payload = builder().begin_message(1);

        match decoder.decode(&payload[..10]) {
            Err(Error::Decode { position, .. }) => assert_eq!(position, Some(9)),
            other => panic!("Expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncate_with_oversized_relation_count() {
        let mut decoder = create_decoder();

        let result = decoder.decode(&[b'T', 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        assert!(matches!(result, Err(Error::Decode { .. })));

        // Decoder still usable afterwards
        let payload = builder().begin_message(1);
        assert!(decoder.decode(&payload).unwrap().is_some());
    }

    #[test]
    fn test_unknown_and_empty_messages() {
        let mut decoder = create_decoder();

        match decoder.decode(b"Zgarbage") {
            Err(Error::Decode { message, position }) => {
                assert!(message.contains("Unknown pgoutput message type"));
                assert_eq!(position, Some(0));
            }
            other => panic!("Expected decode error, got {:?}", other),
        }

        assert!(matches!(decoder.decode(&[]), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_decode_full_transaction() {
        let mut decoder = create_decoder();
        let builder = builder().with_lsn(0x3000060);

        let rows = vec![
            vec![TupleValue::Text("1"), TupleValue::Text("Alice"), TupleValue::Text("t")],
            vec![TupleValue::Text("2"), TupleValue::Text("Bob"), TupleValue::Text("f")],
        ];

        let ops: Vec<ChangeOperation> = builder
            .insert_transaction(42, USERS, &rows)
            .iter()
            .filter_map(|payload| decoder.decode(payload).unwrap())
            .map(|event| {
                if event.op != ChangeOperation::Commit {
                    assert_eq!(event.xid, Some(42));
                }
                event.op
            })
            .collect();

        assert_eq!(
            ops,
            vec![
                ChangeOperation::Begin,
                ChangeOperation::Insert,
                ChangeOperation::Insert,
                ChangeOperation::Commit
            ]
        );
    }

    #[test]
    fn test_plugin_options() {
        let decoder = create_decoder();
        assert_eq!(decoder.plugin(), "pgoutput");
        assert_eq!(
            decoder.plugin_options(),
            vec![
                ("proto_version".to_string(), "1".to_string()),
                ("publication_names".to_string(), "walsub_pub".to_string()),
            ]
        );

        let decoder = create_decoder().with_messages(true);
        assert!(decoder
            .plugin_options()
            .contains(&("messages".to_string(), "true".to_string())));
    }
}
