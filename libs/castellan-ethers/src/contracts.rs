use ethers::contract::abigen;

abigen!(
    DiamondLoupe,
    r"[
        function facetAddresses() external view returns (address[] memory)

        function facetFunctionSelectors(address facet) external view returns (bytes4[] memory)

        function facetAddress(bytes4 selector) external view returns (address)
    ]"
);
