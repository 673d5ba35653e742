//! Ready-made pipelines of the kernel elements.

use std::sync::Arc;
use std::time::Duration;

use netservice::{Chain, NetworkService, Side};

use crate::inject::{DeviceRefs, InjectService};
use crate::ipaddress::IpAddressService;
use crate::ipneighbors::IpNeighborsService;
use crate::iprule::{IpRuleService, PolicyTables, TableReservations};
use crate::kernel::KernelOps;
use crate::mtu::MtuService;
use crate::netns::NamespaceSwitch;
use crate::routes::RoutesService;
use crate::sysctl::{PingGroupRangeService, RouteLocalNetService};

/// Bookkeeping shared by every chain built from it. Build one per process
/// and hand it to each chain.
#[derive(Clone)]
pub struct SharedState {
    pub kernel: Arc<dyn KernelOps>,
    pub namespaces: Arc<dyn NamespaceSwitch>,
    pub tables: Arc<PolicyTables>,
    pub reservations: Arc<TableReservations>,
    pub devices: Arc<DeviceRefs>,
    pub address_timeout: Duration,
}

impl SharedState {
    pub fn new(kernel: Arc<dyn KernelOps>, namespaces: Arc<dyn NamespaceSwitch>) -> Self {
        Self {
            kernel,
            namespaces,
            tables: Arc::default(),
            reservations: Arc::default(),
            devices: Arc::default(),
            address_timeout: crate::ipaddress::DEFAULT_ADDRESS_TIMEOUT,
        }
    }

    pub fn with_address_timeout(mut self, timeout: Duration) -> Self {
        self.address_timeout = timeout;
        self
    }

    fn mtu(&self) -> Arc<dyn NetworkService> {
        Arc::new(MtuService::new(self.kernel.clone(), self.namespaces.clone()))
    }

    fn ipneighbors(&self) -> Arc<dyn NetworkService> {
        Arc::new(IpNeighborsService::new(
            self.kernel.clone(),
            self.namespaces.clone(),
        ))
    }

    fn iprule(&self) -> Arc<dyn NetworkService> {
        Arc::new(IpRuleService::new(
            self.kernel.clone(),
            self.namespaces.clone(),
            self.tables.clone(),
            self.reservations.clone(),
        ))
    }

    fn routes(&self, side: Side) -> Arc<dyn NetworkService> {
        Arc::new(RoutesService::new(
            self.kernel.clone(),
            self.namespaces.clone(),
            side,
        ))
    }

    fn ipaddress(&self, side: Side) -> Arc<dyn NetworkService> {
        Arc::new(
            IpAddressService::new(self.kernel.clone(), self.namespaces.clone(), side)
                .with_timeout(self.address_timeout),
        )
    }

    fn route_localnet(&self) -> Arc<dyn NetworkService> {
        Arc::new(RouteLocalNetService::new(
            self.kernel.clone(),
            self.namespaces.clone(),
        ))
    }

    fn ping_group_range(&self) -> Arc<dyn NetworkService> {
        Arc::new(PingGroupRangeService::new(
            self.kernel.clone(),
            self.namespaces.clone(),
        ))
    }

    fn inject(&self) -> Arc<dyn NetworkService> {
        Arc::new(InjectService::new(
            self.kernel.clone(),
            self.namespaces.clone(),
            self.devices.clone(),
        ))
    }
}

/// Configures the endpoint-facing interface. Each element acts once the
/// ones after it have returned, so the effects land in reverse order:
/// ping group range, addresses, routes, policy routing, neighbors, MTU.
pub fn context_server(state: &SharedState) -> Chain {
    Chain::new(vec![
        state.mtu(),
        state.ipneighbors(),
        state.iprule(),
        state.routes(Side::Server),
        state.ipaddress(Side::Server),
        state.ping_group_range(),
    ])
}

/// Configures the client-side interface.
pub fn context_client(state: &SharedState) -> Chain {
    Chain::new(vec![
        state.mtu(),
        state.ipneighbors(),
        state.routes(Side::Client),
        state.ipaddress(Side::Client),
        state.route_localnet(),
    ])
}

/// Moves the VF in, then configures it as the server side.
pub fn forwarder_server(state: &SharedState) -> Chain {
    Chain::new(vec![state.inject(), Arc::new(context_server(state))])
}

/// Moves the VF in, then configures it as the client side.
pub fn forwarder_client(state: &SharedState) -> Chain {
    Chain::new(vec![state.inject(), Arc::new(context_client(state))])
}
