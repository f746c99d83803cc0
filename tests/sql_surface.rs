use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotledger::tenant::TenantManager;
use slotledger::wire;

const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotledger_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotledger".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, tenant: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(tenant)
        .user("slotledger")
        .password("slotledger");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

async fn add_service(client: &Client, price: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, title, category, price) VALUES ('{id}', 'Room 12', 'Comfort', {price})"
        ))
        .await
        .unwrap();
    id
}

async fn book(client: &Client, service: Ulid, start: i64, end: i64) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO appointments (id, service_id, client_name, client_phone, start_at, end_at) \
             VALUES ('{id}', '{service}', 'Anna', '+79990000000', {start}, {end})"
        ))
        .await?;
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_conflict_reported_as_exclusion_violation() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "hotel").await;
    let sid = add_service(&client, "2500").await;

    let first = book(&client, sid, 10 * H, 11 * H).await.unwrap();
    client
        .batch_execute(&format!(
            "UPDATE appointments SET status = 'confirmed' WHERE id = '{first}'"
        ))
        .await
        .unwrap();

    let err = book(&client, sid, 10 * H + H / 2, 11 * H + H / 2)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    // Back-to-back is fine
    book(&client, sid, 11 * H, 12 * H).await.unwrap();

    // Empty range is a validation error, not a conflict
    let err = book(&client, sid, 10 * H, 10 * H).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE service_id = '{sid}'")).await;
    assert_eq!(listed.len(), 2);
    let confirmed = rows(&client, "SELECT * FROM appointments WHERE status = 'confirmed'").await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].get("id"), Some(first.to_string().as_str()));
    assert_eq!(confirmed[0].get("total_price"), Some("2500"));
    assert_eq!(confirmed[0].get("payment_status"), Some("pending"));
}

#[tokio::test]
async fn payout_flow_over_sql() {
    let (addr, tm) = start_test_server().await;
    let client = connect(addr, "salon").await;

    client
        .batch_execute(
            "UPDATE business_unit SET payout_provider = 'yookassa', payout_account = '40817810000000000001', \
             payout_name = 'OOO Salon', payout_bik = '044525225', payout_provider_extra = '{\"agent_id\": 7}'",
        )
        .await
        .unwrap();
    let unit = rows(&client, "SELECT * FROM business_unit").await;
    assert_eq!(unit[0].get("payout_provider"), Some("yookassa"));
    assert_eq!(unit[0].get("slug"), Some("salon"));
    assert_eq!(unit[0].get("payout_name"), Some("OOO Salon"));
    assert_eq!(unit[0].get("payout_bik"), Some("044525225"));
    assert_eq!(unit[0].get("payout_provider_extra"), Some(r#"{"agent_id":7}"#));

    let sid = add_service(&client, "5000").await;
    let appt = book(&client, sid, 0, H).await.unwrap();
    client
        .batch_execute(&format!(
            "UPDATE appointments SET payment_status = 'paid', payment_id = 'pi_1' WHERE id = '{appt}'"
        ))
        .await
        .unwrap();

    client
        .batch_execute("INSERT INTO payouts (amount, comment) VALUES (1000, 'weekly')")
        .await
        .unwrap();

    let err = client
        .batch_execute("INSERT INTO payouts (amount) VALUES (4500)")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));

    let err = client
        .batch_execute("INSERT INTO payouts (amount) VALUES (0)")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let balance = rows(&client, "SELECT * FROM balance").await;
    assert_eq!(balance[0].get("paid_total"), Some("5000"));
    assert_eq!(balance[0].get("reserved"), Some("1000"));
    assert_eq!(balance[0].get("available"), Some("4000"));
    assert_eq!(balance[0].get("currency"), Some("RUB"));

    let payouts = rows(&client, "SELECT * FROM payouts").await;
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].get("status"), Some("processing"));
    assert_eq!(payouts[0].get("comment"), Some("weekly"));
    let pid = payouts[0].get("provider_payout_id").unwrap().to_string();
    assert!(pid.starts_with("yookassa-"));

    // The webhook surface settles it; SQL sees the result
    let engine = tm.get_existing("salon").unwrap().unwrap();
    engine
        .reconcile_webhook(&serde_json::json!({ "payout_id": pid, "status": "succeeded" }))
        .await
        .unwrap();
    let payouts = rows(&client, "SELECT * FROM payouts").await;
    assert_eq!(payouts[0].get("status"), Some("paid"));
    assert!(payouts[0].get("processed_at").is_some());
    let balance = rows(&client, "SELECT * FROM balance").await;
    assert_eq!(balance[0].get("paid_out"), Some("1000"));
    assert_eq!(balance[0].get("reserved"), Some("0"));
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, _tm) = start_test_server().await;
    let alpha = connect(addr, "alpha").await;
    let beta = connect(addr, "beta").await;

    let sid = add_service(&alpha, "100").await;
    book(&alpha, sid, 0, H).await.unwrap();

    assert_eq!(rows(&alpha, "SELECT * FROM services").await.len(), 1);
    assert!(rows(&beta, "SELECT * FROM services").await.is_empty());
    assert!(rows(&beta, "SELECT * FROM appointments").await.is_empty());

    // The service id is unknown to the other tenant
    let err = book(&beta, sid, 0, H).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "spa").await;
    let sid = add_service(&client, "900").await;
    let appt = book(&client, sid, 0, H).await.unwrap();

    let updated = client
        .execute(
            "UPDATE appointments SET status = $1 WHERE id = $2",
            &[&"confirmed", &appt.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let summary = rows(&client, "SELECT * FROM summary").await;
    assert_eq!(summary[0].get("services"), Some("1"));
    assert_eq!(summary[0].get("total_appointments"), Some("1"));
    assert_eq!(summary[0].get("confirmed_revenue"), Some("900"));
    // 1970-01-01 was a Thursday
    assert_eq!(summary[0].get("weekday_bookings"), Some("[0,0,0,1,0,0,0]"));
    let top: serde_json::Value =
        serde_json::from_str(summary[0].get("top_services").unwrap()).unwrap();
    assert_eq!(top[0]["service_id"], serde_json::json!(sid.to_string()));
    assert_eq!(top[0]["bookings"], serde_json::json!(1));

    // Cancelled never goes back to confirmed
    client
        .execute(
            "UPDATE appointments SET status = $1 WHERE id = $2",
            &[&"cancelled", &appt.to_string()],
        )
        .await
        .unwrap();
    let err = client
        .execute(
            "UPDATE appointments SET status = $1 WHERE id = $2",
            &[&"confirmed", &appt.to_string()],
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "garage").await;

    for sql in [
        "SELEC * FROM services",
        "SELECT * FROM nowhere",
        "DELETE FROM services",
        "INSERT INTO services (id, title) VALUES ('x', 'y')",
    ] {
        let err = client.simple_query(sql).await.unwrap_err();
        assert_eq!(sqlstate(&err), Some("42601"), "{sql}");
    }
}

#[tokio::test]
async fn service_delete_cascades_over_sql() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "studio").await;
    let sid = add_service(&client, "300").await;
    book(&client, sid, 0, H).await.unwrap();
    book(&client, sid, H, 2 * H).await.unwrap();

    client
        .batch_execute(&format!("UPDATE services SET is_available = false WHERE id = '{sid}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM services WHERE is_available = true").await.is_empty());
    let err = book(&client, sid, 3 * H, 4 * H).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    client
        .batch_execute(&format!("DELETE FROM services WHERE id = '{sid}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM appointments").await.is_empty());
    assert!(rows(&client, "SELECT * FROM services").await.is_empty());
}

#[tokio::test]
async fn bound_text_containing_placeholders_is_stored_verbatim() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "motel").await;
    let sid = add_service(&client, "700").await;
    let appt = book(&client, sid, 0, H).await.unwrap();

    let updated = client
        .execute(
            "UPDATE appointments SET client_phone = $1, client_name = $2 WHERE id = $3",
            &[&"555", &"Suite $1 'north'", &appt.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{appt}'")).await;
    assert_eq!(listed[0].get("client_phone"), Some("555"));
    assert_eq!(listed[0].get("client_name"), Some("Suite $1 'north'"));
}

#[tokio::test]
async fn insert_returning_reports_assigned_id() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let sid = add_service(&client, "1200").await;

    let returned = rows(
        &client,
        &format!(
            "INSERT INTO appointments (service_id, client_name, client_phone, start_at, end_at) \
             VALUES ('{sid}', 'Oleg', '+79991112233', 0, {H}) RETURNING *"
        ),
    )
    .await;
    assert_eq!(returned.len(), 1);
    let id = returned[0].get("id").unwrap().to_string();
    assert!(id.parse::<Ulid>().is_ok());
    assert_eq!(returned[0].get("status"), Some("pending"));
    assert_eq!(returned[0].get("payment_status"), Some("pending"));
    assert_eq!(returned[0].get("total_price"), Some("1200"));

    let stored = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{id}'")).await;
    assert_eq!(stored.len(), 1);

    // Same over the extended protocol
    let returned = client
        .query(
            "INSERT INTO appointments (service_id, client_name, client_phone, start_at, end_at) \
             VALUES ($1, $2, $3, 7200000, 10800000) RETURNING *",
            &[&sid.to_string(), &"Irina", &"+79994445566"],
        )
        .await
        .unwrap();
    assert_eq!(returned.len(), 1);
    let status: &str = returned[0].get("status");
    assert_eq!(status, "pending");
    let client_name: &str = returned[0].get("client_name");
    assert_eq!(client_name, "Irina");

    // Without RETURNING the tag alone comes back
    assert!(rows(&client, "INSERT INTO services (title, price) VALUES ('Extra', 10)")
        .await
        .is_empty());
}
