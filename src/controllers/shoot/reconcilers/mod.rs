pub mod config_map;
pub mod kubeconfig;
pub mod quantity_parser;
pub mod quota;
pub mod trust_anchor;
