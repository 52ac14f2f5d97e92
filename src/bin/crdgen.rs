use kube::CustomResourceExt;

use kubenforce_operator::resources::{GroupConfig, NamespaceConfig, UserConfig};

fn main() {
    let crds = [
        serde_yaml::to_string(&NamespaceConfig::crd()).unwrap(),
        serde_yaml::to_string(&GroupConfig::crd()).unwrap(),
        serde_yaml::to_string(&UserConfig::crd()).unwrap(),
    ];
    for crd in crds {
        print!("---\n{crd}");
    }
}
