#[cfg(test)]
mod tests {
    use crate::types::*;
    use serde_json::json;

    #[test]
    fn resource_type_namespace() {
        assert_eq!(
            ResourceTypeId::new("aws/dynamodb/table").namespace(),
            Some("aws")
        );
        assert_eq!(ResourceTypeId::new("aws").namespace(), None);
        assert_eq!(ResourceTypeId::new("/dynamodb/table").namespace(), None);
        assert_eq!(ResourceTypeId::new("aws/").namespace(), None);
    }

    #[test]
    fn link_id_round_trips_endpoints() {
        let id = LinkId::from_endpoints("ordersApi", "ordersTable");
        assert_eq!(id.as_str(), "ordersApi::ordersTable");
        assert_eq!(id.endpoints(), Some(("ordersApi", "ordersTable")));
    }

    #[test]
    fn instance_id_parses_its_own_display() {
        let id = InstanceId::generate();
        let parsed = InstanceId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn instance_id_rejects_garbage() {
        assert!(InstanceId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn has_resource_descends_child_paths() {
        let mut child = BlueprintDocument::default();
        child.resources.insert(
            "subnet".into(),
            ResourceDefinition {
                resource_type: ResourceTypeId::new("aws/vpc/subnet"),
                spec: json!({}),
                metadata: ResourceMetadata::default(),
                depends_on: vec![],
                template_name: None,
            },
        );
        let mut doc = BlueprintDocument::default();
        doc.children.insert("networking".into(), child);

        assert!(doc.has_resource("networking.subnet"));
        assert!(!doc.has_resource("networking.missing"));
        assert!(!doc.has_resource("subnet"));
    }

    #[test]
    fn blueprint_document_serde_round_trip() {
        let mut doc = BlueprintDocument::default();
        doc.variables.insert("env".into(), json!("prod"));
        doc.resources.insert(
            "ordersTable".into(),
            ResourceDefinition {
                resource_type: ResourceTypeId::new("aws/dynamodb/table"),
                spec: json!({"tableName": "orders-${variables.env}"}),
                metadata: ResourceMetadata {
                    display_name: Some("Orders".into()),
                    ..Default::default()
                },
                depends_on: vec![],
                template_name: None,
            },
        );
        doc.links.push(LinkDefinition {
            resource_a: "ordersApi".into(),
            resource_b: "ordersTable".into(),
            label_selector: None,
        });

        let encoded = serde_json::to_string(&doc).unwrap();
        let back: BlueprintDocument = serde_json::from_str(&encoded).unwrap();
        assert_eq!(doc, back);
    }
}
