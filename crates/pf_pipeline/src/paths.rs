//! Content-addressed storage key layout.
//!
//! Ported from `OrderStoragePaths` (`services/storage/paths.py`), which
//! builds keys from the parent `Order`/`LineItem`/`Image`/`*Version` rows
//! rather than from bare IDs; kept here as plain functions over the
//! values those rows carry, since `pf_pipeline` has no need for the
//! wrapper object itself.

pub fn original_image(order_id: i64, line_item_position: i32, image_position: i32, ext: &str) -> String {
    format!("orders/{order_id}/items/{line_item_position}/original/image_{image_position}.{ext}")
}

pub fn coloring_version(
    order_id: i64,
    line_item_position: i32,
    image_position: i32,
    version: i32,
) -> String {
    format!(
        "orders/{order_id}/items/{line_item_position}/coloring/v{version}/image_{image_position}.png"
    )
}

pub fn svg_version(
    order_id: i64,
    line_item_position: i32,
    image_position: i32,
    version: i32,
) -> String {
    format!(
        "orders/{order_id}/items/{line_item_position}/svg/v{version}/image_{image_position}.svg"
    )
}

/// Best-effort extension from a source URL, defaulting to `jpg` the way
/// the source system's downloader does when the URL carries no usable
/// suffix (query strings and fragments are stripped first).
pub fn extension_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    match without_query.rsplit('.').next() {
        Some(ext) if ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            ext.to_ascii_lowercase()
        }
        _ => "jpg".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_key_matches_the_documented_layout() {
        assert_eq!(
            original_image(1270, 1, 1, "jpg"),
            "orders/1270/items/1/original/image_1.jpg"
        );
    }

    #[test]
    fn coloring_key_includes_the_version_segment() {
        assert_eq!(
            coloring_version(1270, 1, 1, 2),
            "orders/1270/items/1/coloring/v2/image_1.png"
        );
    }

    #[test]
    fn extension_falls_back_to_jpg_when_absent() {
        assert_eq!(extension_from_url("https://cdn/x/file"), "jpg");
        assert_eq!(extension_from_url("https://cdn/x.PNG?sig=abc"), "png");
    }
}
