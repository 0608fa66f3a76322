//! Generated protobuf types for the node daemon protocol.

pub mod node {
    tonic::include_proto!("strato.node");
}
