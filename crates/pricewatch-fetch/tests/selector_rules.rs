// Selector rules ship as a YAML file; make sure a realistic file
// round-trips into rules the extractor accepts.

use pricewatch_core::PriceKind;
use pricewatch_fetch::{parse_product_document, SelectorRules};

#[test]
fn yaml_rules_drive_extraction_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("selectors.yaml");
    std::fs::write(
        &path,
        "name: \"h1\"\nprices: \".amount\"\nidentifier: \".article\"\nout_of_stock: \".sold-out\"\n",
    )
    .expect("write rules");

    let rules = SelectorRules::from_yaml_file(&path).expect("load rules");
    let html = r#"
        <html><body>
          <h1>Kettle K1</h1>
          <span class="amount">2 490</span>
          <span class="amount">2 990</span>
          <div class="article">Art. 123789</div>
        </body></html>
    "#;
    let result = parse_product_document(html, &rules).expect("parse");
    assert_eq!(result.name.as_deref(), Some("Kettle K1"));
    assert_eq!(result.prices.get(PriceKind::Card), Some(2490));
    assert_eq!(result.prices.get(PriceKind::Regular), Some(2990));
    assert_eq!(result.identifier.as_deref(), Some("123789"));
    assert!(!result.out_of_stock);
}
