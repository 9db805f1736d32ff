use kube::core::CustomResourceExt;
use msvc_operator::crd::microservice::MicroService;

fn main() -> anyhow::Result<()> {
    let crd = MicroService::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
