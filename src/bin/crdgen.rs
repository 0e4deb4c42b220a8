use anyhow::Context;
use kube::CustomResourceExt;
use cass_access_operator::crd::CassandraAccessPolicy;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&CassandraAccessPolicy::crd())
        .context("serializing the CassandraAccessPolicy CRD")?;
    print!("{yaml}");
    Ok(())
}
