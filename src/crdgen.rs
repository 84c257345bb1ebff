use kube::CustomResourceExt;

use gameserver_operator::crd::{Fleet, GameType, GameTypeAutoscaler, Server};

fn main() {
    let crds = [
        Server::crd(),
        Fleet::crd(),
        GameType::crd(),
        GameTypeAutoscaler::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd).unwrap());
    }
}
