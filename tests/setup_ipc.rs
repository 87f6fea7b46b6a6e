mod test_support;

use serde_json::json;
use test_support::Fixture;

#[test]
fn setup_sections_have_defaults_and_validated_patches() {
    let mut fx = Fixture::new("classbook-setup");

    let setup = fx.ok("setup.get", json!({}));
    assert_eq!(setup["ranking"]["defaultMode"], "ordinal");
    assert_eq!(setup["submissions"]["maxBatchRecords"], 5000);

    let updated = fx.ok(
        "setup.update",
        json!({ "section": "ranking", "patch": { "defaultMode": "Competition" } }),
    );
    assert_eq!(updated["value"]["defaultMode"], "competition");

    let e = fx.err(
        "setup.update",
        json!({ "section": "submissions", "patch": { "maxBatchRecords": 9000 } }),
        "bad_params",
    );
    assert_eq!(e["details"]["section"], "submissions");
    let _ = fx.err(
        "setup.update",
        json!({ "section": "printer", "patch": {} }),
        "bad_params",
    );
    let _ = fx.err(
        "setup.update",
        json!({ "section": "ranking", "patch": { "tieBreak": "name" } }),
        "bad_params",
    );

    let setup = fx.ok("setup.get", json!({}));
    assert_eq!(setup["ranking"]["defaultMode"], "competition");
    assert_eq!(setup["submissions"]["maxBatchRecords"], 5000);
}
