//! Prints the TorchrunJob and TorchrunQueue CRDs as a multi-document YAML stream.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > config/crd/torchrun.yaml
//! ```

use crds::{TorchrunJob, TorchrunQueue};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&TorchrunQueue::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&TorchrunJob::crd())?);
    Ok(())
}
