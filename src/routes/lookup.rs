// Route lookup with longest prefix matching

use super::SystemRoute;
use super::prefix::Ipv4Prefix;
use std::net::Ipv4Addr;

pub struct RouteTable<'a> {
    routes: Vec<(Ipv4Prefix, &'a SystemRoute)>,
}

impl<'a> RouteTable<'a> {
    /// Index a system route snapshot. Entries with an unparsable prefix are ignored.
    pub fn new(routes: &'a [SystemRoute]) -> Self {
        RouteTable {
            routes: routes
                .iter()
                .filter_map(|r| r.destination().ok().map(|p| (p, r)))
                .collect(),
        }
    }

    /// Find the route the host would use for `dest`: longest prefix first, then lowest metric
    pub fn lookup(&self, dest: Ipv4Addr) -> Option<&'a SystemRoute> {
        let mut best_match: Option<(&'a SystemRoute, u8)> = None;

        for &(prefix, route) in &self.routes {
            if !prefix.contains(dest) {
                continue;
            }
            let prefix_len = prefix.prefix_len();
            match best_match {
                None => best_match = Some((route, prefix_len)),
                Some((_, current_len)) if prefix_len > current_len => {
                    best_match = Some((route, prefix_len));
                }
                Some((current, current_len))
                    if prefix_len == current_len && route.route_metric < current.route_metric =>
                {
                    best_match = Some((route, prefix_len));
                }
                _ => {}
            }
        }

        best_match.map(|(route, _)| route)
    }
}
