//! Endpoint selection: partition by preferred tag, then pick uniformly at
//! random within the chosen partition.

use rand::seq::SliceRandom;

use crate::catalog::Endpoint;

/// Picks one endpoint out of `endpoints` to forward a request to.
///
/// Soft affinity: if `prefer` is non-empty and at least one endpoint carries
/// it, selection is restricted to that subset; otherwise every endpoint is
/// eligible. Within the eligible subset, the choice is uniform at random.
/// Returns `None` only when `endpoints` itself is empty — an empty `prefer`
/// partition falls back to the full set rather than failing, since
/// preference is a soft affinity, never a hard filter that can empty the
/// pool.
pub fn select<'a>(endpoints: &'a [Endpoint], prefer: &str) -> Option<&'a Endpoint> {
    if endpoints.is_empty() {
        return None;
    }

    let pool = if prefer.is_empty() {
        endpoints
    } else {
        let preferred: Vec<&Endpoint> = endpoints.iter().filter(|e| e.has_tag(prefer)).collect();
        if preferred.is_empty() {
            endpoints
        } else {
            return preferred.choose(&mut rand::thread_rng()).copied();
        }
    };

    pool.choose(&mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str, tags: &[&str]) -> Endpoint {
        Endpoint::new(host, 80, tags.iter().map(|t| t.to_string()).collect())
    }

    #[test]
    fn empty_set_selects_nothing() {
        assert!(select(&[], "").is_none());
        assert!(select(&[], "blue").is_none());
    }

    #[test]
    fn no_preference_picks_from_full_set() {
        let endpoints = vec![endpoint("a", &[]), endpoint("b", &[])];
        for _ in 0..20 {
            let picked = select(&endpoints, "").unwrap();
            assert!(picked.host == "a" || picked.host == "b");
        }
    }

    #[test]
    fn preference_restricts_to_tagged_subset() {
        let endpoints = vec![
            endpoint("a", &["blue"]),
            endpoint("b", &["green"]),
            endpoint("c", &["blue"]),
        ];
        for _ in 0..50 {
            let picked = select(&endpoints, "blue").unwrap();
            assert_ne!(picked.host, "b");
        }
    }

    #[test]
    fn preference_with_no_match_falls_back_to_full_set() {
        let endpoints = vec![endpoint("a", &["green"]), endpoint("b", &["green"])];
        let picked = select(&endpoints, "blue").unwrap();
        assert!(picked.host == "a" || picked.host == "b");
    }

    #[test]
    fn single_endpoint_is_always_selected() {
        let endpoints = vec![endpoint("only", &[])];
        for _ in 0..10 {
            assert_eq!(select(&endpoints, "anything").unwrap().host, "only");
        }
    }
}
