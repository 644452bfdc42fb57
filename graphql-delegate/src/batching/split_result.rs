//! Splits the result of a merged request back into one result per original request.

use futures::StreamExt;
use futures::stream;

use super::merge::parse_key;
use crate::graphql;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;
use crate::pubsub::split;
use crate::services::ExecutionResult;

/// Splits `result` into `count` shares, in submission order.
///
/// Errors that cannot be attributed to a single request, because they have no path or
/// their path does not start with a prefixed key, are copied into every share. This is an
/// approximation: such an error may only concern some of the requests.
pub fn split_result(result: ExecutionResult, count: usize) -> Vec<ExecutionResult> {
    match result {
        ExecutionResult::Single(response) => split_response(response, count)
            .into_iter()
            .map(ExecutionResult::Single)
            .collect(),
        ExecutionResult::Incremental(responses) => {
            let routed =
                responses.flat_map(move |response| stream::iter(route_response(response, count)));
            split(routed, count, |routed| routed)
                .into_iter()
                .map(|share| ExecutionResult::Incremental(share.boxed()))
                .collect()
        }
    }
}

/// Splits a payload whose data is keyed by prefixed aliases.
fn split_response(response: graphql::Response, count: usize) -> Vec<graphql::Response> {
    let graphql::Response {
        label,
        data,
        path,
        errors,
        extensions,
        has_next,
        ..
    } = response;

    let mut shares: Vec<graphql::Response> = (0..count)
        .map(|_| {
            graphql::Response::builder()
                .and_label(label.clone())
                .and_path(path.clone())
                .extensions(extensions.clone())
                .and_has_next(has_next)
                .build()
        })
        .collect();

    match data {
        Some(Value::Object(object)) => {
            let mut objects: Vec<_> = (0..count).map(|_| serde_json_bytes::Map::new()).collect();
            for (key, value) in object {
                match parse_key(key.as_str()) {
                    Some((index, original)) if index < count => {
                        objects[index].insert(original, value);
                    }
                    _ => {
                        tracing::warn!(
                            key = key.as_str(),
                            count,
                            "dropping unattributable data key"
                        );
                    }
                }
            }
            for (share, object) in shares.iter_mut().zip(objects) {
                share.data = Some(Value::Object(object));
            }
        }
        Some(other) => {
            if !other.is_null() {
                tracing::warn!("merged data is not an object, replacing it with null");
            }
            for share in shares.iter_mut() {
                share.data = Some(Value::Null);
            }
        }
        None => {}
    }

    for error in errors {
        match attribute(error.path.as_ref(), count) {
            Some((index, path)) => shares[index].errors.push(graphql::Error {
                path: Some(path),
                ..error
            }),
            None => {
                for share in shares.iter_mut() {
                    share.errors.push(error.clone());
                }
            }
        }
    }

    shares
}

/// Decides which share an incremental item belongs to.
fn route_response(
    mut response: graphql::Response,
    count: usize,
) -> Vec<(usize, graphql::Response)> {
    let path = match response.path.take() {
        Some(path) if !path.is_empty() => path,
        path => {
            response.path = path;
            return split_response(response, count)
                .into_iter()
                .enumerate()
                .collect();
        }
    };

    let Some((index, rewritten)) = attribute(Some(&path), count) else {
        tracing::warn!(%path, "dropping a patch that does not belong to any request");
        return Vec::new();
    };
    tracing::trace!(index, %path, "routing patch");

    response.path = Some(rewritten);
    for error in response.errors.iter_mut() {
        if let Some((_, path)) = attribute(error.path.as_ref(), count) {
            error.path = Some(path);
        }
    }
    vec![(index, response)]
}

/// Reads the request index out of the first segment of `path` and strips its prefix.
fn attribute(path: Option<&Path>, count: usize) -> Option<(usize, Path)> {
    let path = path?;
    let Some(PathElement::Key(key)) = path.first() else {
        return None;
    };
    let (index, original) = parse_key(key)?;
    if index >= count {
        return None;
    }
    let rewritten = std::iter::once(PathElement::from(original))
        .chain(path.iter().skip(1).cloned())
        .collect();
    Some((index, rewritten))
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn single(result: ExecutionResult) -> graphql::Response {
        result.into_single().unwrap()
    }

    #[test]
    fn keys_go_back_to_their_request() {
        let merged = graphql::Response::builder()
            .data(json!({"_0_a": 1, "_1_a": 2, "_1_b": 3, "_2_c": null}))
            .extension("cost", json!(7))
            .build();

        let shares: Vec<_> = split_result(merged.into(), 3).into_iter().map(single).collect();
        assert_eq!(shares[0].data, Some(json!({"a": 1})));
        assert_eq!(shares[1].data, Some(json!({"a": 2, "b": 3})));
        assert_eq!(shares[2].data, Some(json!({"c": null})));
        assert!(shares.iter().all(|share| share.extensions.get("cost") == Some(&json!(7))));
    }

    #[test]
    fn path_less_errors_reach_every_request() {
        let merged = graphql::Response::builder()
            .data(json!({"_0_a": 1, "_1_a": 2, "_2_a": 3}))
            .error(graphql::Error::builder().message("downstream exploded").build())
            .build();

        let shares: Vec<_> = split_result(merged.into(), 3).into_iter().map(single).collect();
        assert_eq!(shares.len(), 3);
        for share in shares {
            assert_eq!(share.errors.len(), 1);
            assert_eq!(share.errors[0].message, "downstream exploded");
            assert_eq!(share.errors[0].path, None);
        }
    }

    #[test]
    fn errors_with_paths_are_rehomed() {
        let merged = graphql::Response::builder()
            .data(json!({"_0_user": null, "_1_user": {"name": "b"}}))
            .error(
                graphql::Error::builder()
                    .message("not found")
                    .path(Path::from("_0_user/friends/1"))
                    .build(),
            )
            .build();

        let shares: Vec<_> = split_result(merged.into(), 2).into_iter().map(single).collect();
        assert_eq!(shares[0].errors[0].path, Some(Path::from("user/friends/1")));
        assert!(shares[1].errors.is_empty());
        assert_eq!(shares[1].data, Some(json!({"user": {"name": "b"}})));
    }

    #[test]
    fn unknown_keys_are_dropped_and_missing_data_stays_missing() {
        let merged = graphql::Response::builder()
            .data(json!({"_0_a": 1, "a": 2, "_9_a": 3}))
            .build();
        let shares: Vec<_> = split_result(merged.into(), 2).into_iter().map(single).collect();
        assert_eq!(shares[0].data, Some(json!({"a": 1})));
        assert_eq!(shares[1].data, Some(json!({})));

        let shares = split_result(graphql::Response::default().into(), 2);
        assert!(shares.into_iter().map(single).all(|share| share.data.is_none()));

        let merged = graphql::Response::builder().data(Value::Null).build();
        let shares = split_result(merged.into(), 2);
        assert!(
            shares
                .into_iter()
                .map(single)
                .all(|share| share.data == Some(Value::Null))
        );
    }

    #[test]
    fn patches_are_routed_by_their_path() {
        let patch = graphql::Response::builder()
            .data(json!({"name": "b"}))
            .path(Path::from("_1_user"))
            .error(
                graphql::Error::builder()
                    .message("partial")
                    .path(Path::from("_1_user/name"))
                    .build(),
            )
            .build();

        let routed = route_response(patch, 2);
        assert_eq!(routed.len(), 1);
        let (index, patch) = &routed[0];
        assert_eq!(*index, 1);
        assert_eq!(patch.path, Some(Path::from("user")));
        assert_eq!(patch.errors[0].path, Some(Path::from("user/name")));

        let stray = graphql::Response::builder()
            .data(json!({"name": "b"}))
            .path(Path::from("user"))
            .build();
        assert!(route_response(stray, 2).is_empty());
    }

    #[tokio::test]
    async fn incremental_results_share_trailing_items() {
        let items = vec![
            graphql::Response::builder()
                .data(json!({"_0_a": {"id": 1}, "_1_a": {"id": 2}}))
                .has_next(true)
                .build(),
            graphql::Response::builder()
                .data(json!({"name": "one"}))
                .path(Path::from("_0_a"))
                .has_next(true)
                .build(),
            graphql::Response::builder().has_next(false).build(),
        ];
        let shares = split_result(ExecutionResult::Incremental(stream::iter(items).boxed()), 2);

        let mut collected = Vec::new();
        for share in shares {
            collected.push(share.into_stream().collect::<Vec<_>>().await);
        }

        assert_eq!(collected[0].len(), 3);
        assert_eq!(collected[0][1].path, Some(Path::from("a")));
        assert_eq!(collected[0][2].has_next, Some(false));
        assert_eq!(collected[1].len(), 2);
        assert_eq!(collected[1][0].data, Some(json!({"a": {"id": 2}})));
        assert_eq!(collected[1][1].has_next, Some(false));
    }
}
