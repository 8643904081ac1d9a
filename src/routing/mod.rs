pub mod router;

pub use router::{rewrite_path, RouteMatch, RouteTable, RouteTableBuilder};
