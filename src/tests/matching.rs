//! End-to-end matching over a catalog built by the index builder with the
//! deterministic colour embedder.

use crate::embeddings::l2_norm;
use crate::errors::MatchError;
use crate::index::ProductRef;
use crate::matcher::MatchParams;
use crate::price::{parse_price, PriceRange};
use crate::tests::fixtures::{
    context_for, context_with, png_bytes, sample_catalog, test_context, write_png,
    PanicOnceEmbedder, BLUE, DARK_RED, GREEN, RED,
};

fn params(top_k: usize, threshold: f32, min: Option<f64>, max: Option<f64>) -> MatchParams {
    MatchParams {
        top_k,
        threshold,
        price: PriceRange::new(min, max),
    }
}

fn two_image_catalog(dir: &std::path::Path) -> serde_json::Value {
    write_png(&dir.join("front.png"), RED);
    write_png(&dir.join("back.png"), GREEN);
    serde_json::json!([
        {"id": 1, "name": "Jacket", "category": "apparel", "images": [
            {"file": "front.png", "price": "100"},
            {"file": "back.png", "price": "200"}
        ]}
    ])
}

#[test]
fn test_single_product_two_images() {
    let (ctx, _tmp) = context_for(two_image_catalog);

    let results = ctx
        .match_image(&png_bytes(GREEN), &params(1, 0.0, None, None))
        .unwrap();

    assert_eq!(results.len(), 1);
    let product = &results[0];
    assert_eq!(product.name.as_deref(), Some("Jacket"));
    assert_eq!(product.images.len(), 2);
    assert_eq!(product.images[0].file, "/static/back.png");
    assert_eq!(product.images[1].file, "/static/front.png");
    assert!(product.images[0].score >= product.images[1].score);
    assert_eq!(product.min_price, Some(100.0));
    assert_eq!(product.max_price, Some(200.0));
}

#[test]
fn test_price_min_keeps_only_expensive_image() {
    let (ctx, _tmp) = context_for(two_image_catalog);

    let results = ctx
        .match_image(&png_bytes(RED), &params(1, 0.0, Some(150.0), None))
        .unwrap();

    assert_eq!(results.len(), 1);
    let product = &results[0];
    assert_eq!(product.images.len(), 1);
    assert_eq!(product.images[0].file, "/static/back.png");
    assert_eq!(product.images[0].price, Some(200.0));
    assert_eq!(product.min_price, Some(200.0));
    assert_eq!(product.max_price, Some(200.0));
}

#[test]
fn test_identical_image_ranks_first_with_max_score() {
    let (ctx, _tmp) = test_context();

    let results = ctx
        .match_image(&png_bytes(BLUE), &params(6, -1.0, None, None))
        .unwrap();

    let first = &results[0];
    assert_eq!(first.id, serde_json::json!("sku-102"));
    assert!((first.score - 1.0).abs() < 1e-4);
    assert!((first.images[0].score - 1.0).abs() < 1e-4);
}

#[test]
fn test_empty_upload_is_client_error() {
    let (ctx, _tmp) = test_context();
    let err = ctx.match_image(&[], &MatchParams::default()).unwrap_err();
    assert!(matches!(err, MatchError::EmptyUpload));
    assert!(err.is_client_error());
}

#[test]
fn test_embedder_panic_fails_only_that_request() {
    let (ctx, _tmp) = context_with(std::sync::Arc::new(PanicOnceEmbedder::default()), sample_catalog);
    let query = png_bytes(BLUE);

    let err = ctx.match_image(&query, &MatchParams::default()).unwrap_err();
    assert!(matches!(err, MatchError::Unexpected(_)));
    assert!(!err.is_client_error());
    assert!(err.to_string().contains("inference session crashed"));

    let results = ctx.match_image(&query, &MatchParams::default()).unwrap();
    assert_eq!(results[0].id, serde_json::json!("sku-102"));
}

#[test]
fn test_undecodable_upload_is_client_error() {
    let (ctx, _tmp) = test_context();
    let err = ctx
        .match_image(b"GIF89a but not really", &MatchParams::default())
        .unwrap_err();
    assert!(matches!(err, MatchError::Decode(_)));
    assert!(err.is_client_error());
}

#[test]
fn test_missing_image_degrades_product_to_zero_vector() {
    let (ctx, _tmp) = test_context();
    let artifacts = ctx.artifacts();

    assert_eq!(artifacts.product_embeddings.rows(), artifacts.products.len());
    assert_eq!(artifacts.image_embeddings.rows(), artifacts.image_index.len());
    assert!(artifacts.image_index.iter().all(|e| e.file != "gone.png"));

    let ghost = ProductRef::new(3);
    assert!(artifacts.product_embedding(ghost).iter().all(|x| *x == 0.0));
    for product in artifacts.product_refs().filter(|p| *p != ghost) {
        assert!((l2_norm(artifacts.product_embedding(product)) - 1.0).abs() < 1e-5);
    }

    for color in [RED, GREEN, BLUE, DARK_RED] {
        let results = ctx
            .match_image(&png_bytes(color), &params(100, -1.0, None, None))
            .unwrap();
        assert!(results.iter().all(|r| r.id != serde_json::json!(103)));
    }
}

#[test]
fn test_ranking_laws() {
    let (ctx, _tmp) = test_context();

    let cases = [
        params(6, 0.0, None, None),
        params(2, 0.0, None, None),
        params(6, 0.95, None, None),
        params(6, -1.0, Some(120.0), Some(1500.0)),
        params(1, 0.5, None, Some(100.0)),
    ];

    for color in [RED, GREEN, BLUE, [128, 128, 128]] {
        for case in &cases {
            let results = ctx.match_image(&png_bytes(color), case).unwrap();

            assert!(results.len() <= case.top_k);
            assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
            assert!(results.iter().all(|r| r.score >= case.threshold));

            for product in &results {
                assert!(!product.images.is_empty());
                assert!(product.images.windows(2).all(|w| w[0].score >= w[1].score));
                for image in &product.images {
                    if let Some(price) = image.price {
                        assert!(case.price.min.map_or(true, |min| price >= min));
                        assert!(case.price.max.map_or(true, |max| price <= max));
                    }
                }
            }
        }
    }
}

#[test]
fn test_unknown_price_survives_any_bound() {
    let (ctx, _tmp) = test_context();

    let results = ctx
        .match_image(&png_bytes(BLUE), &params(6, -1.0, Some(1.0e9), Some(1.0e9)))
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, serde_json::json!("sku-102"));
    assert_eq!(results[0].images[0].price, None);
    assert_eq!(results[0].min_price, None);
}

#[test]
fn test_matching_is_idempotent() {
    let (ctx, _tmp) = test_context();
    let query = png_bytes([200, 60, 30]);
    let p = params(6, 0.0, Some(100.0), None);

    let first = ctx.match_image(&query, &p).unwrap();
    let second = ctx.match_image(&query, &p).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_index_prices_are_stringified() {
    let (ctx, _tmp) = test_context();
    let prices: Vec<&str> = ctx
        .artifacts()
        .image_index
        .iter()
        .map(|e| e.price.as_str())
        .collect();

    assert_eq!(prices, vec!["₹1,000", "2000", "150", "None"]);
    assert_eq!(parse_price(prices[0]), Some(1000.0));
}
