mod common;

use axum::http::StatusCode;
use common::{fixture, get, router, sales, send, service};
use serde_json::{json, Value};

fn ids(body: &Value, field: &str) -> Vec<String> {
    body["value"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r[field].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn filter_by_key_property_returns_single_row() {
    let app = router(vec![sales().await]);
    let reply = get(&app, "/sales/Countries?$filter=Country_Code%20eq%20'FR'").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["odata-version"], "4.0");
    assert_eq!(reply.body["@odata.context"], json!("/sales/$metadata#Countries"));
    assert_eq!(reply.body["value"].as_array().unwrap().len(), 1);
    assert_eq!(reply.body["value"][0]["Country_Code"], json!("FR"));
}

#[tokio::test]
async fn count_segment_and_inline_count() {
    let app = router(vec![sales().await]);
    let reply = get(&app, "/sales/Countries/$count").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.text, "6");

    let reply = get(&app, "/sales/Countries?$count=true&$orderby=Population%20desc&$top=2&$select=Name").await;
    assert_eq!(reply.body["@odata.count"], json!(6));
    assert_eq!(ids(&reply.body, "Country_Code"), vec!["US", "JP"]);
    assert!(reply.body["value"][0].get("Population").is_none());
}

#[tokio::test]
async fn draft_create_then_activate() {
    let app = router(vec![sales().await]);
    let created = send(&app, "POST", "/sales/FormRoot", &[], Some(json!({ "FirstName": "Bob" }))).await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["IsActiveEntity"], json!(false));
    assert_eq!(created.body["HasActiveEntity"], json!(false));
    let id = created.body["ID"].as_i64().unwrap();

    let uri = format!("/sales/FormRoot(ID={},IsActiveEntity=false)/com.example.sales.draftActivate", id);
    let activated = send(&app, "POST", &uri, &[], None).await;
    assert_eq!(activated.status, StatusCode::OK);
    assert_eq!(activated.body["IsActiveEntity"], json!(true));

    let all = get(&app, "/sales/FormRoot").await;
    let rows = all.body["value"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["IsActiveEntity"], json!(true));
    assert_eq!(rows[0]["FirstName"], json!("Bob"));
}

#[tokio::test]
async fn draft_edit_reads_both_versions() {
    let app = router(vec![sales().await]);
    let created = send(&app, "POST", "/sales/FormRoot", &[], Some(json!({ "FirstName": "Eve" }))).await;
    let id = created.body["ID"].as_i64().unwrap();
    send(&app, "POST", &format!("/sales/FormRoot(ID={},IsActiveEntity=false)/draftActivate", id), &[], None).await;

    let edit = send(&app, "POST", &format!("/sales/FormRoot(ID={},IsActiveEntity=true)/draftEdit", id), &[], None).await;
    assert_eq!(edit.status, StatusCode::OK);
    assert_eq!(edit.body["IsActiveEntity"], json!(false));
    assert_eq!(edit.body["HasActiveEntity"], json!(true));

    let sibling = get(&app, &format!("/sales/FormRoot(ID={},IsActiveEntity=false)/SiblingEntity", id)).await;
    assert_eq!(sibling.status, StatusCode::OK);
    assert_eq!(sibling.body["IsActiveEntity"], json!(true));
    assert_eq!(sibling.body["HasDraftEntity"], json!(true));

    let again = send(&app, "POST", &format!("/sales/FormRoot(ID={},IsActiveEntity=true)/draftEdit", id), &[], None).await;
    assert_eq!(again.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn sticky_new_then_save() {
    let app = router(vec![sales().await]);
    let opened = send(&app, "POST", "/sales/Carts/NewAction", &[], Some(json!({ "Customer": "ACME" }))).await;
    assert_eq!(opened.status, StatusCode::OK);
    let context_id = opened.headers["sap-contextid"].to_str().unwrap().to_string();
    assert!(context_id.starts_with("SID:ANON:"));
    assert_eq!(opened.body["__transient"], json!(true));
    let id = opened.body["CartID"].as_i64().unwrap();

    let patched = send(
        &app,
        "PATCH",
        &format!("/sales/Carts({})", id),
        &[("sap-contextid", &context_id)],
        Some(json!({ "Customer": "Globex" })),
    )
    .await;
    assert_eq!(patched.status, StatusCode::OK);
    assert_eq!(get(&app, "/sales/Carts/$count").await.text, "0");

    let saved = send(&app, "POST", &format!("/sales/Carts({})/SaveChanges", id), &[("sap-contextid", &context_id)], None).await;
    assert_eq!(saved.status, StatusCode::OK);
    assert!(saved.body.get("__transient").is_none());

    let read = get(&app, &format!("/sales/Carts({})", id)).await;
    assert_eq!(read.status, StatusCode::OK);
    assert_eq!(read.body["Customer"], json!("Globex"));
    assert!(read.body.get("__transient").is_none());
    assert!(read.headers.get("sap-contextid").is_none());

    let no_session = send(&app, "POST", "/sales/Carts/SaveChanges", &[], None).await;
    assert_eq!(no_session.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn groupby_sums_each_group() {
    let app = router(vec![sales().await]);
    let reply = get(&app, "/sales/Ratings?$apply=groupby((Customer),aggregate(CreditScore))&$orderby=Customer").await;
    assert_eq!(reply.status, StatusCode::OK);
    let rows = reply.body["value"].as_array().unwrap();
    let sums: Vec<(String, i64)> = rows
        .iter()
        .map(|r| (r["Customer"].as_str().unwrap().to_string(), r["CreditScore"].as_f64().unwrap() as i64))
        .collect();
    assert_eq!(
        sums,
        vec![
            ("ACME".to_string(), 20),
            ("Globex".to_string(), 25),
            ("Initech".to_string(), 15),
            ("Umbrella".to_string(), 12)
        ]
    );
}

#[tokio::test]
async fn hierarchy_top_levels() {
    let app = router(vec![sales().await]);
    let reply = get(
        &app,
        "/sales/Orgs?$apply=com.sap.vocabularies.Hierarchy.v1.TopLevels(HierarchyNodes=$root/Orgs,HierarchyQualifier='OrgHierarchy',NodeProperty='ID',Levels=2)",
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(ids(&reply.body, "ID"), vec!["World", "EMEA", "US"]);
    assert_eq!(reply.body["value"][0]["DistanceFromRoot"], json!(0));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let app = router(vec![sales().await]);
    let created = send(
        &app,
        "POST",
        "/sales/Countries",
        &[("X-Tenant-ID", "acme")],
        Some(json!({ "Country_Code": "NL", "Name": "Netherlands" })),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.headers["X-Tenant-ID"], "acme");

    let acme = send(&app, "GET", "/sales/Countries/$count", &[("X-Tenant-ID", "acme")], None).await;
    assert_eq!(acme.text, "7");
    let other = send(&app, "GET", "/sales/Countries/$count", &[("X-Tenant-ID", "globex")], None).await;
    assert_eq!(other.text, "6");
    let client = get(&app, "/sales/Countries/$count?sap-client=100").await;
    assert_eq!(client.text, "6");
    assert_eq!(client.headers["X-Tenant-ID"], "tenant-100");

    let duplicate = send(
        &app,
        "POST",
        "/sales/Countries",
        &[("X-Tenant-ID", "acme")],
        Some(json!({ "Country_Code": "NL" })),
    )
    .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn minimal_preference_and_delete() {
    let app = router(vec![sales().await]);
    let created = send(
        &app,
        "POST",
        "/sales/Countries",
        &[("Prefer", "return=minimal")],
        Some(json!({ "Country_Code": "PT", "Name": "Portugal" })),
    )
    .await;
    assert_eq!(created.status, StatusCode::NO_CONTENT);

    let deleted = send(&app, "DELETE", "/sales/Countries('PT')", &[], None).await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
    assert_eq!(get(&app, "/sales/Countries('PT')").await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn service_document_and_errors() {
    let app = router(vec![sales().await]);
    let doc = get(&app, "/sales").await;
    assert_eq!(doc.status, StatusCode::OK);
    let names: Vec<&str> = doc.body["value"].as_array().unwrap().iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"Countries"));

    assert_eq!(get(&app, "/sales/$metadata").await.status, StatusCode::NOT_FOUND);
    assert_eq!(get(&app, "/sales/Unknown").await.status, StatusCode::NOT_FOUND);
    assert_eq!(get(&app, "/elsewhere/Countries").await.status, StatusCode::NOT_FOUND);
    assert_eq!(get(&app, "/sales/Countries?$filter=((Name").await.status, StatusCode::BAD_REQUEST);
    assert_eq!(get(&app, "/health").await.status, StatusCode::OK);
}

#[tokio::test]
async fn legacy_dialect_envelopes() {
    let seeds = tempfile::tempdir().unwrap();
    std::fs::write(
        seeds.path().join("Products.json"),
        r#"[{"ProductID":"P1","Name":"Bolt","Price":"0.50","SupplierID":"S1"},{"ProductID":"P2","Name":"Nut","Price":"0.20","SupplierID":"S2"}]"#,
    )
    .unwrap();
    std::fs::write(
        seeds.path().join("Suppliers.json"),
        r#"[{"ID":"S1","Name":"Steelworks"},{"ID":"S2","Name":"Ironmongers"}]"#,
    )
    .unwrap();
    let legacy = service("legacy/service.json", "/legacy", seeds.path().to_path_buf()).await;
    let app = router(vec![sales().await, legacy]);

    let reply = get(&app, "/legacy/Products?$inlinecount=allpages&$top=1").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["dataserviceversion"], "2.0");
    assert_eq!(reply.body["d"]["__count"], json!("2"));
    let first = &reply.body["d"]["results"][0];
    assert_eq!(first["__metadata"]["uri"], json!("/legacy/Products('P1')"));
    assert_eq!(first["__metadata"]["type"], json!("LEGACY_SRV.Product"));
    assert_eq!(first["to_Supplier"]["__deferred"]["uri"], json!("/legacy/Products('P1')/to_Supplier"));

    let expanded = get(&app, "/legacy/Products('P2')?$expand=to_Supplier").await;
    assert_eq!(expanded.body["d"]["to_Supplier"]["Name"], json!("Ironmongers"));

    let merged = send(&app, "MERGE", "/legacy/Products('P2')", &[], Some(json!({ "Name": "Hex nut" }))).await;
    assert_eq!(merged.status, StatusCode::NO_CONTENT);
    let name = get(&app, "/legacy/Products('P2')/Name").await;
    assert_eq!(name.body, json!({ "d": { "Name": "Hex nut" } }));

    // the V4 service is still served next to it
    assert_eq!(get(&app, "/sales/Countries/$count").await.text, "6");
    assert!(fixture("legacy/service.json").exists());
}

#[tokio::test]
async fn operational_routes_describe_registered_services() {
    let empty = router(Vec::new());
    let not_ready = get(&empty, "/ready").await;
    assert_eq!(not_ready.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(not_ready.body["services"], json!([]));

    let app = router(vec![sales().await]);
    let health = get(&app, "/health").await;
    assert_eq!(health.body, json!({ "status": "ok", "services": 1 }));

    let ready = get(&app, "/ready").await;
    assert_eq!(ready.status, StatusCode::OK);
    assert_eq!(
        ready.body["services"][0],
        json!({ "path": "/sales", "odata_version": "4.0", "entity_sets": 5, "has_metadata": false })
    );

    let info = get(&app, "/info").await;
    assert_eq!(info.body["name"], json!("odata-mockserver"));
    assert_eq!(info.body["default_tenant"], json!("tenant-default"));
    assert_eq!(info.body["strict_key_mode"], json!(false));
    assert_eq!(get(&app, "/version").await.body, info.body);
}
