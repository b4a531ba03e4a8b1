//! Prints the CRD manifests as a multi-document YAML stream.

use crds::{SpiderEndpoint, SpiderIPPool};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [SpiderIPPool::crd(), SpiderEndpoint::crd()];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
