use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&kibana_operator::resources::kibanas::Kibana::crd()).unwrap()
    )
}
